//! Connection table mapping client endpoints to relay paths
//!
//! Every operation takes the single table lock, so lookup-or-create sequences
//! cannot produce two entries for the same client even when packets arrive
//! concurrently. The table never acts on an entry's handle; whoever removes an
//! entry is responsible for closing it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A tracked client and its relay handle
#[derive(Debug)]
pub struct ConnectionEntry<H> {
    client: SocketAddr,
    handle: H,
    last_activity: Mutex<Instant>,
}

impl<H> ConnectionEntry<H> {
    fn new(client: SocketAddr, handle: H) -> Self {
        Self {
            client,
            handle,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Address of the client this entry belongs to
    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Record activity in either direction
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Time since the last recorded activity, measured against `now`
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }
}

/// Thread-safe map from client endpoint to connection entry
#[derive(Debug)]
pub struct ConnectionTable<H> {
    entries: Mutex<HashMap<SocketAddr, Arc<ConnectionEntry<H>>>>,
}

impl<H> Default for ConnectionTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> ConnectionTable<H> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, client: &SocketAddr) -> Option<Arc<ConnectionEntry<H>>> {
        self.entries.lock().get(client).cloned()
    }

    /// Insert a fresh entry, replacing any existing one for the same client
    pub fn insert(&self, client: SocketAddr, handle: H) -> Arc<ConnectionEntry<H>> {
        let entry = Arc::new(ConnectionEntry::new(client, handle));
        self.entries.lock().insert(client, Arc::clone(&entry));
        entry
    }

    pub fn remove(&self, client: &SocketAddr) -> Option<Arc<ConnectionEntry<H>>> {
        self.entries.lock().remove(client)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Look up the entry for `client`, creating it with `make` if absent.
    ///
    /// The lookup and the insert happen under one lock acquisition. `make` runs
    /// while the lock is held, so it must be quick and must not block on I/O.
    /// Returns the entry and whether it was created by this call.
    pub fn get_or_try_insert_with<E, F>(
        &self,
        client: SocketAddr,
        make: F,
    ) -> Result<(Arc<ConnectionEntry<H>>, bool), E>
    where
        F: FnOnce() -> Result<H, E>,
    {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&client) {
            return Ok((Arc::clone(entry), false));
        }

        let entry = Arc::new(ConnectionEntry::new(client, make()?));
        entries.insert(client, Arc::clone(&entry));
        Ok((entry, true))
    }

    /// Remove every entry idle for strictly longer than `idle_timeout`
    pub fn sweep(&self, idle_timeout: Duration) -> Vec<Arc<ConnectionEntry<H>>> {
        let now = Instant::now();
        let mut removed = Vec::new();

        self.entries.lock().retain(|_, entry| {
            if entry.idle_for(now) > idle_timeout {
                removed.push(Arc::clone(entry));
                false
            } else {
                true
            }
        });

        removed
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<Arc<ConnectionEntry<H>>> {
        self.entries.lock().drain().map(|(_, entry)| entry).collect()
    }

    pub fn clients(&self) -> Vec<SocketAddr> {
        self.entries.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_insert_get_remove() {
        let table = ConnectionTable::new();
        assert!(table.is_empty());

        table.insert(addr(1000), "a");
        table.insert(addr(1001), "b");
        assert_eq!(table.len(), 2);

        let entry = table.get(&addr(1000)).unwrap();
        assert_eq!(entry.client(), addr(1000));
        assert_eq!(*entry.handle(), "a");

        assert!(table.remove(&addr(1000)).is_some());
        assert!(table.get(&addr(1000)).is_none());
        assert!(table.remove(&addr(1000)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_insert_replaces_existing() {
        let table = ConnectionTable::new();
        table.insert(addr(1000), 1);
        table.insert(addr(1000), 2);

        assert_eq!(table.len(), 1);
        assert_eq!(*table.get(&addr(1000)).unwrap().handle(), 2);
    }

    #[test]
    fn test_get_or_try_insert_with_reuses_entry() {
        let table = ConnectionTable::new();

        let (first, created) = table
            .get_or_try_insert_with(addr(2000), || Ok::<_, ()>(7))
            .unwrap();
        assert!(created);

        let (second, created) = table
            .get_or_try_insert_with(addr(2000), || -> Result<i32, ()> {
                panic!("factory must not run for an existing entry")
            })
            .unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_get_or_try_insert_with_failure_leaves_table_untouched() {
        let table: ConnectionTable<u8> = ConnectionTable::new();

        let result = table.get_or_try_insert_with(addr(2001), || Err("dial failed"));
        assert_eq!(result.unwrap_err(), "dial failed");
        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_lookup_or_create_yields_one_entry() {
        let table = Arc::new(ConnectionTable::new());
        let created = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let created = Arc::clone(&created);
                std::thread::spawn(move || {
                    for port in 0..50u16 {
                        let (_, was_created) = table
                            .get_or_try_insert_with(addr(3000 + port), || Ok::<_, ()>(()))
                            .unwrap();
                        if was_created {
                            created.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(table.len(), 50);
        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_stale_entries() {
        let table = ConnectionTable::new();
        table.insert(addr(4000), ());

        tokio::time::advance(Duration::from_millis(1500)).await;
        table.insert(addr(4001), ());

        tokio::time::advance(Duration::from_millis(600)).await;

        // 4000 has been idle 2.1s, 4001 only 0.6s
        let removed = table.sweep(Duration::from_secs(2));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].client(), addr(4000));
        assert_eq!(table.clients(), vec![addr(4001)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_retains_entry_at_threshold() {
        let table = ConnectionTable::new();
        table.insert(addr(4100), ());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(table.sweep(Duration::from_secs(2)).is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(table.sweep(Duration::from_secs(2)).len(), 1);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_keeps_entry_alive() {
        let table = ConnectionTable::new();
        let entry = table.insert(addr(4200), ());

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(1)).await;
            entry.touch();
            assert!(table.sweep(Duration::from_millis(1500)).is_empty());
        }

        assert_eq!(entry.idle_for(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn test_drain_empties_table() {
        let table = ConnectionTable::new();
        for port in 0..5 {
            table.insert(addr(5000 + port), port);
        }

        let drained = table.drain();
        assert_eq!(drained.len(), 5);
        assert!(table.is_empty());
    }
}
