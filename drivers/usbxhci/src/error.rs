use core::fmt;

/// xHCI core error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XhciError {
    /// Register window has not been mapped yet
    NotMapped,
    /// Hardware resources are missing or too small for the reported layout
    InvalidResources,
    /// Operation is not valid in the current lifecycle state
    InvalidState,
    /// Invalid argument or configuration value
    InvalidParameter,
    /// Port number outside 1..=max_ports
    InvalidPort,
    /// DMA memory allocation failed
    InsufficientResources,
    /// Controller did not halt after the run bit was cleared
    StopTimeout,
    /// Controller did not halt after the reset bit was set
    ResetHaltTimeout,
    /// Controller Not Ready did not clear after reset
    ResetNotReadyTimeout,
    /// Controller stayed halted after the run bit was set
    RunTimeout,
    /// A fatal controller condition was observed; the instance is unusable
    ControllerFailed,
}

impl XhciError {
    /// Get a human-readable description of the error
    pub fn description(self) -> &'static str {
        match self {
            XhciError::NotMapped => "xHCI registers are not mapped",
            XhciError::InvalidResources => "xHCI hardware resources are invalid",
            XhciError::InvalidState => "operation not valid in current controller state",
            XhciError::InvalidParameter => "invalid xHCI parameter",
            XhciError::InvalidPort => "invalid xHCI root hub port",
            XhciError::InsufficientResources => "xHCI DMA memory exhausted",
            XhciError::StopTimeout => "xHCI controller did not halt",
            XhciError::ResetHaltTimeout => "xHCI controller did not halt during reset",
            XhciError::ResetNotReadyTimeout => "xHCI controller stayed not ready after reset",
            XhciError::RunTimeout => "xHCI controller did not leave the halted state",
            XhciError::ControllerFailed => "xHCI controller reported a fatal error",
        }
    }

    /// True for the bounded-poll failures of the lifecycle transitions
    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            XhciError::StopTimeout
                | XhciError::ResetHaltTimeout
                | XhciError::ResetNotReadyTimeout
                | XhciError::RunTimeout
        )
    }
}

impl fmt::Display for XhciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Result type for xHCI operations
pub type Result<T> = core::result::Result<T, XhciError>;
