use std::io;

/// Whether an I/O error means the process is out of a resource it cannot
/// recover from in place.
pub fn is_resource_exhaustion(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::OutOfMemory
}

/// Abort the process on resource exhaustion; any other error is returned so the
/// caller can log it and carry on.
pub fn abort_on_exhaustion(component: &str, err: io::Error) -> io::Error {
    if is_resource_exhaustion(&err) {
        tracing::error!(component, error = %err, "resource exhausted, aborting");
        std::process::abort();
    }
    err
}
