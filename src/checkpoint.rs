// src/checkpoint.rs
// Speichern und Laden eines kompletten Stacks (bincode, serde-Bruecke).
// Dateiaufbau: Header (Kennung + Version), danach der Stack.
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use bincode::config;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::model::Stack;

const MAGIC: &str = "stackformer";
const VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    magic: String,
    version: u32,
}

pub fn save_stack(stack: &Stack, p_path: impl AsRef<Path>) -> Result<()> {
    let p_path = p_path.as_ref();
    let f = File::create(p_path)?;
    let mut w = BufWriter::with_capacity(8 * 1024 * 1024, f);
    let cfg = config::standard();

    let header = Header {
        magic: MAGIC.to_string(),
        version: VERSION,
    };
    bincode::serde::encode_into_std_write(&header, &mut w, cfg).map_err(|e| Error::Checkpoint(e.to_string()))?;
    let i_bytes =
        bincode::serde::encode_into_std_write(stack, &mut w, cfg).map_err(|e| Error::Checkpoint(e.to_string()))?;
    w.flush()?;

    info!(path = %p_path.display(), bytes = i_bytes, "checkpoint saved");
    Ok(())
}

pub fn load_stack(p_path: impl AsRef<Path>) -> Result<Stack> {
    let p_path = p_path.as_ref();
    let f = File::open(p_path)?;
    let mut r = BufReader::with_capacity(8 * 1024 * 1024, f);
    let cfg = config::standard();

    let header: Header =
        bincode::serde::decode_from_std_read(&mut r, cfg).map_err(|e| Error::Checkpoint(e.to_string()))?;
    if header.magic != MAGIC {
        return Err(Error::Checkpoint(format!("{} is not a stack checkpoint", p_path.display())));
    }
    if header.version != VERSION {
        return Err(Error::Checkpoint(format!(
            "unsupported checkpoint version {} (expected {VERSION})",
            header.version
        )));
    }

    let stack: Stack =
        bincode::serde::decode_from_std_read(&mut r, cfg).map_err(|e| Error::Checkpoint(e.to_string()))?;
    info!(path = %p_path.display(), reversible = stack.is_reversible(), "checkpoint loaded");
    Ok(stack)
}
