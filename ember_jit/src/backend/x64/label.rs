//! Branch targets.
//!
//! A label is unused, linked or bound. While linked it heads a chain of
//! pending branch sites threaded through the displacement slots themselves:
//! each 32-bit slot of a [`Label`] holds `previous_slot + 1` (0 ends the
//! chain), and each 8-bit slot of a [`NearLabel`] holds the distance back to
//! the previous slot (0 ends the chain). Binding walks the chain and writes
//! the real displacements.

/// State shared by both label widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelState {
    /// Never referenced.
    #[default]
    Unused,
    /// Referenced; the payload is the most recent slot position.
    Linked(usize),
    /// Bound to a code offset.
    Bound(usize),
}

/// Label reached through 32-bit displacements.
#[derive(Debug, Default)]
pub struct Label {
    pub(crate) state: LabelState,
}

impl Label {
    /// Create an unused label.
    pub const fn new() -> Self {
        Label {
            state: LabelState::Unused,
        }
    }

    /// Whether the label is bound.
    #[inline]
    pub fn is_bound(&self) -> bool {
        matches!(self.state, LabelState::Bound(_))
    }

    /// Whether the label has pending references.
    #[inline]
    pub fn is_linked(&self) -> bool {
        matches!(self.state, LabelState::Linked(_))
    }

    /// Whether the label was never referenced or bound.
    #[inline]
    pub fn is_unused(&self) -> bool {
        matches!(self.state, LabelState::Unused)
    }

    /// Bound offset.
    ///
    /// Aborts if the label is not bound.
    #[inline]
    pub fn position(&self) -> usize {
        match self.state {
            LabelState::Bound(pos) => pos,
            other => ember_core::fatal!("label is not bound: {:?}", other),
        }
    }
}

impl Drop for Label {
    fn drop(&mut self) {
        if self.is_linked() && !std::thread::panicking() {
            tracing::warn!(state = ?self.state, "label dropped with unresolved references");
        }
    }
}

/// Label reached through 8-bit displacements.
#[derive(Debug, Default)]
pub struct NearLabel {
    pub(crate) state: LabelState,
}

impl NearLabel {
    /// Create an unused near label.
    pub const fn new() -> Self {
        NearLabel {
            state: LabelState::Unused,
        }
    }

    /// Whether the label is bound.
    #[inline]
    pub fn is_bound(&self) -> bool {
        matches!(self.state, LabelState::Bound(_))
    }

    /// Whether the label has pending references.
    #[inline]
    pub fn is_linked(&self) -> bool {
        matches!(self.state, LabelState::Linked(_))
    }

    /// Bound offset; aborts if unbound.
    #[inline]
    pub fn position(&self) -> usize {
        match self.state {
            LabelState::Bound(pos) => pos,
            other => ember_core::fatal!("near label is not bound: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_states() {
        let mut label = Label::new();
        assert!(label.is_unused());
        label.state = LabelState::Linked(4);
        assert!(label.is_linked());
        label.state = LabelState::Bound(12);
        assert!(label.is_bound());
        assert_eq!(label.position(), 12);
    }

    #[test]
    #[should_panic(expected = "label is not bound")]
    fn test_unbound_position_is_fatal() {
        Label::new().position();
    }

    #[test]
    fn test_near_label_default() {
        let label = NearLabel::default();
        assert!(!label.is_bound());
        assert!(!label.is_linked());
    }
}
