use std::{future::Future, sync::LazyLock, time::Duration};

use regex::Regex;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

const MAX_ID_LEN: usize = 48;

static NON_ID_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("static pattern"));

/// Derives a filesystem-safe instance id from a display name.
///
/// Returns `None` when nothing usable is left (empty or symbol-only names).
pub fn derive_id(name: &str) -> Option<String> {
    let lowered = name.trim().to_ascii_lowercase();
    let slug = NON_ID_CHARS.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        return None;
    }

    let mut id: String = slug.chars().take(MAX_ID_LEN).collect();
    while id.ends_with('-') {
        id.pop();
    }
    Some(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

/// Evaluates `check` every `interval` until it returns true, `timeout` elapses, or `cancel` fires.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }
        if check().await {
            return PollOutcome::Ready;
        }

        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut;
        }

        let nap = interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = sleep(nap) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    #[test]
    fn derive_id_slugifies() {
        assert_eq!(derive_id("alpha").as_deref(), Some("alpha"));
        assert_eq!(derive_id("  My Survival World! ").as_deref(), Some("my-survival-world"));
        assert_eq!(derive_id("SMP__2024").as_deref(), Some("smp-2024"));
        assert_eq!(derive_id("Ünïcode").as_deref(), Some("n-code"));
    }

    #[test]
    fn derive_id_rejects_empty_results() {
        assert_eq!(derive_id(""), None);
        assert_eq!(derive_id("   "), None);
        assert_eq!(derive_id("!!!"), None);
    }

    #[test]
    fn derive_id_caps_length_without_trailing_dash() {
        let name = format!("{}-{}", "a".repeat(47), "b".repeat(10));
        let id = derive_id(&name).unwrap();
        assert_eq!(id.len(), 47);
        assert!(!id.ends_with('-'));
    }

    #[tokio::test]
    async fn poll_until_ready() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = poll_until(
            Duration::from_secs(5),
            Duration::from_millis(10),
            &CancellationToken::new(),
            || {
                let counter = counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst) >= 2 }
            },
        )
        .await;
        assert_eq!(outcome, PollOutcome::Ready);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_until_times_out() {
        let outcome = poll_until(
            Duration::from_millis(50),
            Duration::from_millis(10),
            &CancellationToken::new(),
            || async { false },
        )
        .await;
        assert_eq!(outcome, PollOutcome::TimedOut);
    }

    #[tokio::test]
    async fn poll_until_honours_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let outcome = poll_until(
            Duration::from_secs(10),
            Duration::from_millis(10),
            &cancel,
            || async { false },
        )
        .await;
        assert_eq!(outcome, PollOutcome::Cancelled);
    }
}
