// Standardized error codes for the extension sandbox.
// Execution codes describe a unit that started and failed; admission codes
// describe a request that was refused before anything ran.

pub mod execution {
    pub const TIMEOUT: &str = "SANDBOX_TIMEOUT";
    pub const MEMORY: &str = "SANDBOX_MEMORY";
    pub const SECURITY: &str = "SANDBOX_SECURITY";
    pub const PERMISSION: &str = "SANDBOX_PERMISSION";
    pub const RUNTIME: &str = "SANDBOX_RUNTIME";
}

pub mod admission {
    pub const RATE_LIMITED: &str = "ADMISSION_RATE_LIMITED";
    pub const CONTEXT_LIMIT_REACHED: &str = "ADMISSION_CONTEXT_LIMIT";
    pub const CONTEXT_NOT_FOUND: &str = "ADMISSION_CONTEXT_NOT_FOUND";
    pub const CONTEXT_INACTIVE: &str = "ADMISSION_CONTEXT_INACTIVE";
    pub const EXTENSION_DISABLED: &str = "ADMISSION_EXTENSION_DISABLED";
    pub const INVALID_REQUEST: &str = "ADMISSION_INVALID_REQUEST";
}

pub mod host {
    pub const INITIALIZATION_FAILED: &str = "HOST_INITIALIZATION_FAILED";
    pub const CONFIGURATION: &str = "HOST_CONFIGURATION";
}

/// Map a failure kind name (`timeout`, `memory`, ...) to its execution code.
/// Unknown kinds fall back to the runtime code.
pub fn execution_code(kind: &str) -> &'static str {
    match kind {
        "timeout" => execution::TIMEOUT,
        "memory" => execution::MEMORY,
        "security" => execution::SECURITY,
        "permission" => execution::PERMISSION,
        _ => execution::RUNTIME,
    }
}
