//! Parallel layer rendering with ordered emission.
//!
//! Layers are rendered on a dedicated rayon pool, one window of layer indices
//! at a time, and pushed through a bounded channel. The calling thread puts
//! them back in order and hands them one by one to the consumer, which owns
//! every piece of mutable export state (emitter, filters, output stream).
//!
//! The channel bound is what limits memory: once `queue_capacity` rendered
//! layers wait for the consumer, workers block on send.

use crate::config::PipelineConfig;
use crate::{Error, Result};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::thread;
use tracing::debug;

/// How a pipeline run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Completed,
    Cancelled,
}

/// Render `count` layers with `render` on worker threads and feed them to
/// `consume` in index order on the calling thread.
///
/// `cancel` is polled before every render and before every consume. The first
/// error from either side stops the producer and is returned as is.
pub fn run<T, R, C>(
    count: usize,
    config: &PipelineConfig,
    cancel: &AtomicBool,
    render: R,
    mut consume: C,
) -> Result<PipelineStatus>
where
    T: Send,
    R: Fn(usize) -> Result<T> + Sync,
    C: FnMut(usize, T) -> Result<()>,
{
    if cancel.load(Ordering::Relaxed) {
        return Ok(PipelineStatus::Cancelled);
    }
    if count == 0 {
        return Ok(PipelineStatus::Completed);
    }

    let workers = config.effective_workers().max(1);
    let window = config.window.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("gcode-render-{i}"))
        .build()
        .map_err(|e| Error::Pipeline(format!("cannot start render workers: {e}")))?;
    debug!(count, workers, window, capacity = config.queue_capacity, "starting layer pipeline");

    let (tx, rx) = sync_channel::<(usize, Result<T>)>(config.queue_capacity.max(1));
    // Raised by the consumer on failure; the caller's flag is left alone.
    let abort = AtomicBool::new(false);

    thread::scope(|s| {
        let render = &render;
        let pool = &pool;
        let abort = &abort;
        let stopped = move || cancel.load(Ordering::Relaxed) || abort.load(Ordering::Relaxed);

        let producer = thread::Builder::new()
            .name("gcode-producer".into())
            .spawn_scoped(s, move || {
                let mut start = 0;
                while start < count && !stopped() {
                    let end = (start + window).min(count);
                    pool.install(|| {
                        (start..end)
                            .into_par_iter()
                            .for_each_with(tx.clone(), |tx, index| {
                                if stopped() {
                                    return;
                                }
                                // A closed channel means the consumer gave up
                                let _ = tx.send((index, render(index)));
                            });
                    });
                    start = end;
                }
            })
            .map_err(|e| Error::Pipeline(format!("cannot start producer: {e}")))?;

        let outcome = consume_in_order(rx, count, cancel, abort, &mut consume);

        match producer.join() {
            Ok(()) => outcome,
            Err(_) => Err(Error::Pipeline("a render worker panicked".into())),
        }
    })
}

fn consume_in_order<T, C>(
    rx: Receiver<(usize, Result<T>)>,
    count: usize,
    cancel: &AtomicBool,
    abort: &AtomicBool,
    consume: &mut C,
) -> Result<PipelineStatus>
where
    C: FnMut(usize, T) -> Result<()>,
{
    let mut pending: BTreeMap<usize, T> = BTreeMap::new();
    let mut next = 0;

    for (index, rendered) in rx {
        let layer = match rendered {
            Ok(layer) => layer,
            Err(e) => {
                abort.store(true, Ordering::Relaxed);
                return Err(e);
            }
        };
        pending.insert(index, layer);

        while let Some(layer) = pending.remove(&next) {
            if cancel.load(Ordering::Relaxed) {
                abort.store(true, Ordering::Relaxed);
                return Ok(PipelineStatus::Cancelled);
            }
            if let Err(e) = consume(next, layer) {
                abort.store(true, Ordering::Relaxed);
                return Err(e);
            }
            next += 1;
        }
    }

    if next == count {
        Ok(PipelineStatus::Completed)
    } else if cancel.load(Ordering::Relaxed) {
        Ok(PipelineStatus::Cancelled)
    } else {
        Err(Error::Pipeline(format!(
            "layer {next} of {count} was never rendered"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(workers: usize, capacity: usize, window: usize) -> PipelineConfig {
        PipelineConfig {
            workers,
            queue_capacity: capacity,
            window,
        }
    }

    #[test]
    fn test_layers_consumed_in_order() {
        let cancel = AtomicBool::new(false);
        let mut seen = Vec::new();
        let status = run(
            50,
            &config(4, 3, 8),
            &cancel,
            |i| {
                // Later layers of a window tend to finish first
                thread::sleep(Duration::from_micros(((50 - i) % 7) as u64 * 200));
                Ok(i * 10)
            },
            |i, v| {
                assert_eq!(v, i * 10);
                seen.push(i);
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(status, PipelineStatus::Completed);
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_single_worker_matches() {
        let cancel = AtomicBool::new(false);
        let mut seen = Vec::new();
        run(
            10,
            &config(1, 1, 1),
            &cancel,
            |i| Ok(format!("layer {i}")),
            |_, v| {
                seen.push(v);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(seen.len(), 10);
        assert_eq!(seen[9], "layer 9");
    }

    #[test]
    fn test_render_error_propagates() {
        let cancel = AtomicBool::new(false);
        let mut consumed = 0;
        let result = run(
            20,
            &config(2, 2, 4),
            &cancel,
            |i| {
                if i == 5 {
                    Err(Error::Geometry {
                        object: "cube".into(),
                        message: "empty path".into(),
                    })
                } else {
                    Ok(i)
                }
            },
            |_, _| {
                consumed += 1;
                Ok(())
            },
        );

        assert!(matches!(result, Err(Error::Geometry { .. })));
        assert!(consumed <= 5);
        assert!(!cancel.load(Ordering::Relaxed));
    }

    #[test]
    fn test_consumer_error_stops_pipeline() {
        let cancel = AtomicBool::new(false);
        let result = run(
            100,
            &config(2, 2, 4),
            &cancel,
            Ok,
            |i, _| {
                if i == 3 {
                    Err(Error::Pipeline("disk full".into()))
                } else {
                    Ok(())
                }
            },
        );
        match result {
            Err(Error::Pipeline(msg)) => assert_eq!(msg, "disk full"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_cancel_mid_run() {
        let cancel = AtomicBool::new(false);
        let mut consumed = Vec::new();
        let status = run(
            100,
            &config(2, 2, 4),
            &cancel,
            Ok,
            |i, _| {
                consumed.push(i);
                if i == 10 {
                    cancel.store(true, Ordering::Relaxed);
                }
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(status, PipelineStatus::Cancelled);
        assert_eq!(consumed.last(), Some(&10));
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = AtomicBool::new(true);
        let status = run(
            5,
            &config(2, 2, 2),
            &cancel,
            |_| -> Result<()> { panic!("nothing should render") },
            |_, _| Ok(()),
        )
        .unwrap();
        assert_eq!(status, PipelineStatus::Cancelled);
    }

    #[test]
    fn test_empty_run_completes() {
        let cancel = AtomicBool::new(false);
        let status = run(0, &config(2, 2, 2), &cancel, Ok, |_, _: usize| Ok(())).unwrap();
        assert_eq!(status, PipelineStatus::Completed);
    }
}
