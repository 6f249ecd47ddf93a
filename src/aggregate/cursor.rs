//! Registry of suspended cursor requests.
//!
//! A cursor is checked out of the registry for the duration of a read, so a
//! concurrent read of the same id sees it as missing. Idle cursors are
//! collected lazily whenever the registry is touched.

use super::request::Request;
use crate::error::{QueryError, QueryErrorCode, Result};
use crate::output::ExecutionResult;
use lru::LruCache;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

struct Cursor {
    request: Request,
    chunk_size: usize,
    max_idle: Duration,
    last_access: Instant,
}

impl Cursor {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_access) >= self.max_idle
    }
}

struct Inner {
    cursors: LruCache<u64, Cursor>,
    next_id: u64,
}

/// Live cursors, bounded by the configured maximum
pub struct CursorList {
    inner: Mutex<Inner>,
    capacity: usize,
}

fn no_cursor(id: u64) -> QueryError {
    QueryError::new(QueryErrorCode::NoCursor, format!("Cursor not found, id: {}", id))
}

impl CursorList {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                cursors: LruCache::unbounded(),
                next_id: 1,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the first chunk of `request`; keep it registered while it has rows left
    pub fn execute(&self, mut request: Request) -> Result<ExecutionResult> {
        let Some(opts) = request.cursor_options() else {
            return request.execute();
        };
        self.gc();
        if self.len() >= self.capacity {
            return Err(QueryError::limit("Too many cursors allocated for index"));
        }

        let mut result = request.read_chunk(Some(opts.chunk_size))?;
        if result.exhausted {
            return Ok(result);
        }
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.cursors.put(
            id,
            Cursor {
                request,
                chunk_size: opts.chunk_size,
                max_idle: Duration::from_millis(opts.max_idle_ms),
                last_access: Instant::now(),
            },
        );
        debug!(cursor_id = id, "cursor opened");
        result.cursor_id = Some(id);
        Ok(result)
    }

    /// Read the next chunk of cursor `id`; `count` overrides the chunk size
    pub fn read(&self, id: u64, count: Option<usize>) -> Result<ExecutionResult> {
        self.gc();
        let mut cursor = self.inner.lock().cursors.pop(&id).ok_or_else(|| no_cursor(id))?;

        let max_rows = count.filter(|c| *c > 0).unwrap_or(cursor.chunk_size);
        let mut result = cursor.request.read_chunk(Some(max_rows))?;
        if result.exhausted {
            debug!(cursor_id = id, "cursor exhausted");
            return Ok(result);
        }
        cursor.last_access = Instant::now();
        self.inner.lock().cursors.put(id, cursor);
        result.cursor_id = Some(id);
        Ok(result)
    }

    /// Drop cursor `id` and its request
    pub fn delete(&self, id: u64) -> Result<()> {
        match self.inner.lock().cursors.pop(&id) {
            Some(_) => {
                debug!(cursor_id = id, "cursor deleted");
                Ok(())
            }
            None => Err(no_cursor(id)),
        }
    }

    /// Remove idle cursors, returning how many were dropped
    pub fn gc(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<u64> = inner
            .cursors
            .iter()
            .filter(|(_, c)| c.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            inner.cursors.pop(id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "collected idle cursors");
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::request::RequestKind;
    use crate::index;
    use crate::pipeline::processor::tests::numbers_index;
    use crate::utils::EngineConfig;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn cursor_request(v: &[&str]) -> Request {
        let idx = index::shared(numbers_index(5));
        Request::prepare(RequestKind::Aggregate, &args(v), idx, &EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_cursor_reads_in_chunks() {
        let list = CursorList::new(4);
        let req = cursor_request(&["*", "LOAD", "1", "@n", "WITHCURSOR", "COUNT", "2"]);

        let first = list.execute(req).unwrap();
        assert_eq!(first.rows.len(), 2);
        let id = first.cursor_id.unwrap();
        assert_eq!(list.len(), 1);

        let second = list.read(id, None).unwrap();
        assert_eq!(second.rows.len(), 2);
        assert_eq!(second.cursor_id, Some(id));

        let last = list.read(id, Some(10)).unwrap();
        assert_eq!(last.rows.len(), 1);
        assert_eq!(last.cursor_id, None);
        assert!(list.is_empty());

        let err = list.read(id, None).unwrap_err();
        assert_eq!(err.code, QueryErrorCode::NoCursor);
    }

    #[test]
    fn test_cursor_limit_and_delete() {
        let list = CursorList::new(1);
        let first = list
            .execute(cursor_request(&["*", "WITHCURSOR", "COUNT", "1"]))
            .unwrap();
        let id = first.cursor_id.unwrap();

        let err = list
            .execute(cursor_request(&["*", "WITHCURSOR", "COUNT", "1"]))
            .unwrap_err();
        assert_eq!(err.code, QueryErrorCode::Limit);

        list.delete(id).unwrap();
        assert_eq!(list.delete(id).unwrap_err().code, QueryErrorCode::NoCursor);
    }

    #[test]
    fn test_idle_cursors_collected() {
        let list = CursorList::new(4);
        let first = list
            .execute(cursor_request(&["*", "WITHCURSOR", "COUNT", "1", "MAXIDLE", "1"]))
            .unwrap();
        assert!(first.cursor_id.is_some());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(list.gc(), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn test_non_cursor_request_runs_to_completion() {
        let list = CursorList::new(4);
        let result = list.execute(cursor_request(&["*"])).unwrap();
        assert_eq!(result.rows.len(), 5);
        assert_eq!(result.cursor_id, None);
        assert!(list.is_empty());
    }
}
