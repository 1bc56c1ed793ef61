use std::fmt;

/// An incoming message that the receiving controller cannot accept in its current state.
/// Always fatal: it means the hierarchy has lost track of a line somewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolViolation {
    pub component: String,
    pub addr: u64,
    pub state: String,
    pub message: String,
}

impl ProtocolViolation {
    pub fn new(
        component: impl Into<String>,
        addr: u64,
        state: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            addr,
            state: state.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "protocol violation in {} at {:#x} (state {}): {}",
            self.component, self.addr, self.state, self.message
        )
    }
}

impl std::error::Error for ProtocolViolation {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_survives_anyhow_roundtrip() {
        let err: anyhow::Error = ProtocolViolation::new("l1.0", 0x40, "I", "unexpected Inv").into();
        let text = format!("{err}");
        assert!(text.contains("0x40"));
        assert!(text.contains("unexpected Inv"));
        assert!(err.downcast_ref::<ProtocolViolation>().is_some());
    }
}
