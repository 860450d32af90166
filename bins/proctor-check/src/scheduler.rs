/// Concurrency Scheduler - bounded-parallel case execution
///
/// **Core Responsibility:**
/// Run many fixtures against one executable with a counting admission gate,
/// collecting exactly one outcome per fixture into a shared map.
///
/// **Boundary Guarantees:**
/// - Nothing escapes: a panicking or erroring case becomes a synthetic
///   failing outcome tagged `unhandled: ...`, logged with its full chain, so
///   one broken fixture cannot prevent the rest from being collected
/// - Nothing is abandoned: cases still in flight past the suite timeout are
///   logged and then joined unconditionally; the scheduler never cancels a
///   case mid-run (the runner's own cleanup phase owns process teardown)
/// - No ordering across cases; within a case the runner feeds input strictly
///   in file order

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::FutureExt;
use proctor_common::{Fixture, Outcome};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

fn synthetic_failure(executable: &Path, fixture: &Fixture, message: String) -> Outcome {
    Outcome {
        passed: false,
        executable: executable.to_path_buf(),
        fixture: fixture.clone(),
        expected_text: None,
        actual_text: None,
        message,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Run every fixture through `run_case` with at most `concurrency` in
/// flight, returning the outcome map keyed by fixture.
pub async fn run_suite<F, Fut>(
    run_case: F,
    executable: PathBuf,
    fixtures: Vec<Fixture>,
    concurrency: usize,
    suite_timeout: Duration,
) -> HashMap<Fixture, Outcome>
where
    F: Fn(Fixture) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let outcomes: Arc<Mutex<HashMap<Fixture, Outcome>>> = Arc::new(Mutex::new(HashMap::new()));

    let mut handles = Vec::new();
    for (number, fixture) in fixtures.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let outcomes = Arc::clone(&outcomes);
        let run_case = run_case.clone();
        let executable = executable.clone();
        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            let case = fixture.identifier();
            let outcome = match AssertUnwindSafe(run_case(fixture.clone()))
                .catch_unwind()
                .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => {
                    error!(case = %case, error = ?err, "case failed unexpectedly");
                    synthetic_failure(&executable, &fixture, format!("unhandled: error {err:#}"))
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(case = %case, panic = %message, "case panicked");
                    synthetic_failure(&executable, &fixture, format!("unhandled: panic {message}"))
                }
            };
            if outcome.passed {
                debug!(case = %case, number = number + 1, "case passed");
            } else {
                info!(case = %case, number = number + 1, message = %outcome.message, "case failed");
            }
            outcomes.lock().await.insert(fixture, outcome);
        }));
    }

    let deadline = tokio::time::Instant::now() + suite_timeout;
    for mut handle in handles {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let joined = match tokio::time::timeout(remaining, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(
                    executable = %executable.display(),
                    "suite timeout exceeded; waiting for straggler case"
                );
                handle.await
            }
        };
        if let Err(err) = joined {
            // panics inside cases are already converted above; this is only
            // reachable for aborted tasks
            error!(error = %err, "case task could not be joined");
        }
    }

    match Arc::try_unwrap(outcomes) {
        Ok(outcomes) => outcomes.into_inner(),
        Err(outcomes) => {
            let guard = outcomes.lock().await;
            guard.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_fixtures(n: usize) -> Vec<Fixture> {
        (0..n)
            .map(|i| {
                Fixture::new(
                    Some(PathBuf::from(format!("/q/{i}-input.txt"))),
                    Some(PathBuf::from(format!("/q/{i}-expected.txt"))),
                    None,
                    Vec::new(),
                )
            })
            .collect()
    }

    fn fabricated(executable: &Path, fixture: &Fixture) -> Outcome {
        Outcome {
            passed: true,
            executable: executable.to_path_buf(),
            fixture: fixture.clone(),
            expected_text: Some("hello, world".to_string()),
            actual_text: Some("hello, world".to_string()),
            message: "fake".to_string(),
        }
    }

    #[tokio::test]
    async fn collects_one_outcome_per_fixture() {
        let fixtures = sample_fixtures(6);
        let outcomes = run_suite(
            |fixture| async move { Ok::<_, anyhow::Error>(fabricated(Path::new("true"), &fixture)) },
            PathBuf::from("true"),
            fixtures.clone(),
            4,
            Duration::from_secs(60),
        )
        .await;

        assert_eq!(outcomes.len(), fixtures.len());
        for fixture in &fixtures {
            assert_eq!(outcomes.get(fixture).unwrap().message, "fake");
        }
    }

    #[tokio::test]
    async fn panicking_case_becomes_unhandled_outcome() {
        let fixtures = sample_fixtures(3);
        let victim = fixtures[1].clone();
        let outcomes = run_suite(
            move |fixture| {
                let victim = victim.clone();
                async move {
                    if fixture == victim {
                        panic!("fixture exploded");
                    }
                    Ok::<_, anyhow::Error>(fabricated(Path::new("true"), &fixture))
                }
            },
            PathBuf::from("true"),
            fixtures.clone(),
            2,
            Duration::from_secs(60),
        )
        .await;

        assert_eq!(outcomes.len(), 3);
        let broken = outcomes.get(&fixtures[1]).unwrap();
        assert!(!broken.passed);
        assert_eq!(broken.message, "unhandled: panic fixture exploded");
        assert!(outcomes.get(&fixtures[0]).unwrap().passed);
    }

    #[tokio::test]
    async fn erroring_case_becomes_unhandled_outcome() {
        let fixtures = sample_fixtures(1);
        let outcomes = run_suite(
            |_fixture| async move { anyhow::bail!("expected file vanished") },
            PathBuf::from("true"),
            fixtures.clone(),
            1,
            Duration::from_secs(60),
        )
        .await;

        let outcome = outcomes.get(&fixtures[0]).unwrap();
        assert!(!outcome.passed);
        assert!(outcome.message.starts_with("unhandled: error"));
        assert!(outcome.message.contains("expected file vanished"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_one_serializes_cases() {
        let fixtures = sample_fixtures(6);
        let start = tokio::time::Instant::now();
        let outcomes = run_suite(
            |fixture| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, anyhow::Error>(fabricated(Path::new("true"), &fixture))
            },
            PathBuf::from("true"),
            fixtures,
            1,
            Duration::from_secs(60),
        )
        .await;

        assert_eq!(outcomes.len(), 6);
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(300),
            "serialized run finished in {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ample_concurrency_approaches_slowest_case() {
        let fixtures = sample_fixtures(6);
        let start = tokio::time::Instant::now();
        let outcomes = run_suite(
            |fixture| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, anyhow::Error>(fabricated(Path::new("true"), &fixture))
            },
            PathBuf::from("true"),
            fixtures,
            6,
            Duration::from_secs(60),
        )
        .await;

        assert_eq!(outcomes.len(), 6);
        let elapsed = start.elapsed();
        assert!(
            elapsed < Duration::from_millis(100),
            "parallel run took {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn straggler_past_suite_timeout_is_still_joined() {
        let fixtures = sample_fixtures(1);
        let outcomes = run_suite(
            |fixture| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, anyhow::Error>(fabricated(Path::new("true"), &fixture))
            },
            PathBuf::from("true"),
            fixtures.clone(),
            1,
            Duration::from_secs(1),
        )
        .await;

        // joined unconditionally after the timeout was logged
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes.get(&fixtures[0]).unwrap().passed);
    }
}
