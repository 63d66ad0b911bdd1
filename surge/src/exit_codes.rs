#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,

    /// Invalid CLI/scenario/options (bad flags, invalid durations, bad target weights, etc.).
    InvalidInput = 30,

    /// Internal/runtime error (results file, worker processes, IO).
    RuntimeError = 40,
}

impl ExitCode {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}
