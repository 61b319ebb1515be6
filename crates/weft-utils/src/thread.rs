use std::thread::JoinHandle;

/// Spawns a named worker thread. The name shows up in debuggers and in
/// panic messages from the worker.
///
/// Panics only if the OS refuses to spawn, which callers treat as fatal at
/// startup time.
pub fn spawn_worker<F>(name: &str, f: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(f)
        .unwrap_or_else(|e| panic!("couldn't spawn worker thread: {e}"))
}
