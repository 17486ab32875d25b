use std::fmt;
use std::sync::{Arc, OnceLock};

/// Which path finished a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSource {
    Callback,
    Fallback,
    Timeout,
    Invocation,
}

impl fmt::Display for CompletionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            CompletionSource::Callback => "callback",
            CompletionSource::Fallback => "fallback",
            CompletionSource::Timeout => "timeout",
            CompletionSource::Invocation => "invocation",
        })
    }
}

/// Single-assignment completion flag shared by all completion paths of one
/// run. The first `try_complete` wins; every later attempt is refused.
#[derive(Debug, Clone, Default)]
pub struct CompletionLatch {
    cell: Arc<OnceLock<CompletionSource>>,
}

impl CompletionLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_complete(&self, source: CompletionSource) -> bool {
        self.cell.set(source).is_ok()
    }

    pub fn winner(&self) -> Option<CompletionSource> {
        self.cell.get().copied()
    }

    pub fn is_complete(&self) -> bool {
        self.cell.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_first_completion_wins() {
        let latch = CompletionLatch::new();
        assert!(latch.try_complete(CompletionSource::Fallback));
        assert!(!latch.try_complete(CompletionSource::Callback));
        assert_eq!(latch.winner(), Some(CompletionSource::Fallback));
    }

    #[test]
    fn test_concurrent_paths_have_exactly_one_winner() {
        for _ in 0..50 {
            let latch = CompletionLatch::new();
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = [CompletionSource::Callback, CompletionSource::Fallback]
                .into_iter()
                .map(|source| {
                    let latch = latch.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        latch.try_complete(source)
                    })
                })
                .collect();

            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(wins, 1);
            assert!(latch.is_complete());
        }
    }
}
