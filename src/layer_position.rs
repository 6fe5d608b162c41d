// layer_position.rs
// ============================================================================
// Hinweis: Position einer Schicht innerhalb ihres Stacks (erste / letzte).
//          Wird beim Aufbau als Wert an den Block-Builder uebergeben.
// ============================================================================

use serde::{Deserialize, Serialize};

/// First/Last-Markierung einer Replik im Block-Stack.
///
/// Beide Flags starten gesetzt; der Aufbau loescht sie fuer jede Replik,
/// die nicht die erste bzw. nicht die letzte ist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerPosition {
    b_first: bool,
    b_last: bool,
}

impl Default for LayerPosition {
    fn default() -> Self {
        Self {
            b_first: true,
            b_last: true,
        }
    }
}

impl LayerPosition {
    /// Position der Replik `i_index` in einem Stack aus `i_num_layers` Repliken.
    pub fn for_index(i_index: usize, i_num_layers: usize) -> Self {
        let mut position = Self::default();
        if i_index > 0 {
            position.mark_not_first();
        }
        if i_index + 1 < i_num_layers {
            position.mark_not_last();
        }
        position
    }

    pub fn is_first(&self) -> bool {
        self.b_first
    }

    pub fn is_last(&self) -> bool {
        self.b_last
    }

    pub fn mark_not_first(&mut self) {
        self.b_first = false;
    }

    pub fn mark_not_last(&mut self) {
        self.b_last = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_layer_is_first_and_last() {
        let position = LayerPosition::for_index(0, 1);
        assert!(position.is_first());
        assert!(position.is_last());
    }

    #[test]
    fn flags_follow_index() {
        let v_positions: Vec<_> = (0..4).map(|i| LayerPosition::for_index(i, 4)).collect();
        assert!(v_positions[0].is_first() && !v_positions[0].is_last());
        for position in &v_positions[1..3] {
            assert!(!position.is_first() && !position.is_last());
        }
        assert!(!v_positions[3].is_first() && v_positions[3].is_last());
    }

    #[test]
    fn marks_are_independent() {
        let mut position = LayerPosition::default();
        position.mark_not_last();
        assert!(position.is_first());
        assert!(!position.is_last());
    }
}
