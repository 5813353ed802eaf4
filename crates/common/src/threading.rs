use anyhow::{Result, anyhow};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Tracks the named worker threads a process has running so shutdown paths
/// and diagnostics can see what is still alive.
#[derive(Clone, Default)]
pub struct ThreadRegistry {
    active: Arc<Mutex<Vec<String>>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: impl Into<String>, f: F) -> Result<ThreadHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(|e| anyhow!("failed to spawn thread '{name}': {e}"))?;

        self.active
            .lock()
            .expect("thread registry mutex poisoned")
            .push(name.clone());

        Ok(ThreadHandle {
            name,
            handle: Some(handle),
            active: Arc::clone(&self.active),
        })
    }

    pub fn active_thread_names(&self) -> Vec<String> {
        self.active
            .lock()
            .expect("thread registry mutex poisoned")
            .clone()
    }
}

pub struct ThreadHandle {
    name: String,
    handle: Option<JoinHandle<()>>,
    active: Arc<Mutex<Vec<String>>>,
}

impl ThreadHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join(mut self) -> std::thread::Result<()> {
        self.deregister();
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }

    fn deregister(&self) {
        let mut active = self.active.lock().expect("thread registry mutex poisoned");
        if let Some(pos) = active.iter().position(|n| n == &self.name) {
            active.remove(pos);
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        // Dropping detaches the thread; the registry just stops listing it.
        self.deregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn spawn_registers_and_join_deregisters() {
        let registry = ThreadRegistry::new();
        let (tx, rx) = mpsc::channel();
        let handle = registry
            .spawn("test-worker", move || {
                rx.recv().ok();
            })
            .unwrap();

        assert_eq!(registry.active_thread_names(), vec!["test-worker"]);
        tx.send(()).unwrap();
        handle.join().unwrap();
        assert!(registry.active_thread_names().is_empty());
    }

    #[test]
    fn dropping_a_handle_detaches_but_deregisters() {
        let registry = ThreadRegistry::new();
        let handle = registry.spawn("short-lived", || {}).unwrap();
        drop(handle);
        assert!(registry.active_thread_names().is_empty());
    }
}
