//! Bounded-concurrency fan-out scheduler
//!
//! Runs up to `limit` [`AsyncOperation`]s at once and hands every completion
//! back to the calling thread, one at a time, in completion order. The
//! calling thread is the interpreter's owning thread: the producer and the
//! dispatcher are both invoked there and never overlap.
//!
//! Failure policy: the first producer or dispatch failure stops admission and
//! is returned to the caller. Operations that were already launched are still
//! awaited and dispatched, so every callback is either invoked or released and
//! no native work is left running unobserved. Failures after the first are
//! logged. Fan-out jobs that were never launched are dropped, which releases
//! their callbacks without invoking them.

use crate::operation::{AsyncOperation, OperationError, OperationValue, ResultType};
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};

/// Default concurrency for pull-style runs.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Default concurrency for process batches.
pub const DEFAULT_BATCH_CONCURRENCY: usize = 32;

/// An already-started operation offered by a pull producer.
pub struct Admission<K> {
    pub operation: AsyncOperation,
    pub result_type: ResultType,
    pub callback: K,
}

impl<K> Admission<K> {
    pub fn new(operation: AsyncOperation, result_type: ResultType, callback: K) -> Self {
        Self {
            operation,
            result_type,
            callback,
        }
    }
}

/// Work known up front that is only launched once it gets a slot.
pub struct Job<K> {
    launch: Box<dyn FnOnce() -> AsyncOperation>,
    result_type: ResultType,
    callback: K,
}

impl<K> Job<K> {
    pub fn new(
        launch: impl FnOnce() -> AsyncOperation + 'static,
        result_type: ResultType,
        callback: K,
    ) -> Self {
        Self {
            launch: Box::new(launch),
            result_type,
            callback,
        }
    }

    fn start(self) -> Admission<K> {
        Admission::new((self.launch)(), self.result_type, self.callback)
    }
}

/// Decoded result handed to the dispatcher.
///
/// `Ok(None)` means the operation succeeded but has nothing to deliver under
/// its result type.
pub type Delivery = Result<Option<OperationValue>, OperationError>;

/// One completed slot, in the order it completed.
pub struct Completion<K> {
    /// Zero-based admission order of the operation.
    pub sequence: usize,
    pub callback: K,
    pub result: Delivery,
}

/// Counters describing a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub admitted: usize,
    pub dispatched: usize,
    pub callback_failures: usize,
    /// Fan-out jobs that were never launched because of a failure.
    pub abandoned: usize,
    /// Highest number of simultaneously outstanding operations.
    pub peak_outstanding: usize,
}

struct Slot<K> {
    operation: AsyncOperation,
    result_type: ResultType,
    callback: K,
    sequence: usize,
}

/// Slot table for one run. Entries are allocated on first use, so a large
/// limit costs nothing until that many operations are actually outstanding.
struct Slots<K> {
    entries: Vec<Option<Slot<K>>>,
    free: Vec<usize>,
    limit: usize,
    occupied: usize,
    next_sequence: usize,
    completed_tx: Sender<usize>,
    completed_rx: Receiver<usize>,
}

impl<K> Slots<K> {
    fn new(limit: usize) -> Self {
        let (completed_tx, completed_rx) = mpsc::channel();
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            limit,
            occupied: 0,
            next_sequence: 0,
            completed_tx,
            completed_rx,
        }
    }

    fn is_full(&self) -> bool {
        self.occupied >= self.limit
    }

    fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Callers check `is_full` first.
    fn admit(&mut self, admission: Admission<K>, report: &mut RunReport) {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.entries.push(None);
                self.entries.len() - 1
            }
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let tx = self.completed_tx.clone();
        admission.operation.on_complete(move || {
            let _ = tx.send(index);
        });

        self.entries[index] = Some(Slot {
            operation: admission.operation,
            result_type: admission.result_type,
            callback: admission.callback,
            sequence,
        });
        self.occupied += 1;
        debug_assert!(self.occupied <= self.limit);

        report.admitted += 1;
        report.peak_outstanding = report.peak_outstanding.max(self.occupied);
        tracing::debug!(slot = index, sequence, outstanding = self.occupied, "operation admitted");
    }

    /// Block until some outstanding operation completes and free its slot.
    ///
    /// `None` only if the completion channel is gone, which cannot happen
    /// while `self` holds a sender.
    fn wait_next(&mut self) -> Option<Completion<K>> {
        loop {
            let index = self.completed_rx.recv().ok()?;
            let Some(slot) = self.entries.get_mut(index).and_then(Option::take) else {
                continue;
            };
            self.occupied -= 1;
            self.free.push(index);

            let result_type = slot.result_type;
            let result = slot.operation.wait().map(|value| result_type.decode(value));
            tracing::debug!(slot = index, sequence = slot.sequence, ok = result.is_ok(), "operation completed");
            return Some(Completion {
                sequence: slot.sequence,
                callback: slot.callback,
                result,
            });
        }
    }
}

/// Scheduler configured with a concurrency limit.
///
/// One `run` owns its slot array; the scheduler itself holds no state between
/// runs.
#[derive(Debug, Clone, Copy)]
pub struct BoundedScheduler {
    limit: usize,
}

impl BoundedScheduler {
    /// A limit of zero is treated as one.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Pull discipline.
    ///
    /// `producer` is asked for the next admission until it returns `Ok(None)`.
    /// It is only asked while a slot is free: at capacity the thread first
    /// blocks until one operation completes and dispatches it, so whatever
    /// the producer launches is admitted immediately.
    pub fn run<K, E, P, D>(&self, mut producer: P, mut dispatch: D) -> Result<RunReport, E>
    where
        P: FnMut() -> Result<Option<Admission<K>>, E>,
        D: FnMut(Completion<K>) -> Result<(), E>,
        E: fmt::Display,
    {
        let mut slots = Slots::new(self.limit);
        let mut report = RunReport::default();
        let mut failure = None;

        while failure.is_none() {
            if slots.is_full() {
                let Some(completion) = slots.wait_next() else {
                    break;
                };
                deliver(completion, &mut dispatch, &mut failure, &mut report);
                continue;
            }
            match producer() {
                Ok(Some(admission)) => slots.admit(admission, &mut report),
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(error = %err, "producer failed, stopping admission");
                    failure = Some(err);
                }
            }
        }

        drain(&mut slots, &mut dispatch, &mut failure, &mut report);
        finish(failure, report)
    }

    /// Pre-populated fan-out discipline.
    ///
    /// The first `limit` jobs are launched immediately; each completion is
    /// dispatched and then refilled from the remaining jobs in their original
    /// order.
    pub fn run_fan_out<K, E, I, D>(&self, jobs: I, mut dispatch: D) -> Result<RunReport, E>
    where
        I: IntoIterator<Item = Job<K>>,
        D: FnMut(Completion<K>) -> Result<(), E>,
        E: fmt::Display,
    {
        let mut jobs = jobs.into_iter();
        let mut slots = Slots::new(self.limit);
        let mut report = RunReport::default();
        let mut failure = None;

        while failure.is_none() {
            if slots.is_full() {
                let Some(completion) = slots.wait_next() else {
                    break;
                };
                deliver(completion, &mut dispatch, &mut failure, &mut report);
                continue;
            }
            match jobs.next() {
                Some(job) => slots.admit(job.start(), &mut report),
                None => break,
            }
        }

        drain(&mut slots, &mut dispatch, &mut failure, &mut report);

        for job in jobs {
            report.abandoned += 1;
            drop(job);
        }
        if report.abandoned > 0 {
            tracing::debug!(abandoned = report.abandoned, "unlaunched jobs released");
        }
        finish(failure, report)
    }
}

impl Default for BoundedScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

fn deliver<K, E, D>(
    completion: Completion<K>,
    dispatch: &mut D,
    failure: &mut Option<E>,
    report: &mut RunReport,
) where
    D: FnMut(Completion<K>) -> Result<(), E>,
    E: fmt::Display,
{
    let sequence = completion.sequence;
    report.dispatched += 1;
    if let Err(err) = dispatch(completion) {
        report.callback_failures += 1;
        if failure.is_none() {
            tracing::debug!(sequence, error = %err, "callback failed, stopping admission");
            *failure = Some(err);
        } else {
            tracing::warn!(sequence, error = %err, "callback failed after an earlier failure");
        }
    }
}

fn drain<K, E, D>(
    slots: &mut Slots<K>,
    dispatch: &mut D,
    failure: &mut Option<E>,
    report: &mut RunReport,
) where
    D: FnMut(Completion<K>) -> Result<(), E>,
    E: fmt::Display,
{
    while !slots.is_empty() {
        let Some(completion) = slots.wait_next() else {
            break;
        };
        deliver(completion, dispatch, failure, report);
    }
}

fn finish<E>(failure: Option<E>, report: RunReport) -> Result<RunReport, E> {
    match failure {
        Some(err) => Err(err),
        None => Ok(report),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Completer, Outcome};
    use crate::registry::{CallableHandle, CallableRegistry};
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn sleeper(ms: u64, value: i32) -> AsyncOperation {
        AsyncOperation::spawn_thread("sleeper", move || {
            thread::sleep(Duration::from_millis(ms));
            Ok(OperationValue::Int(value))
        })
    }

    #[test]
    fn dispatches_in_completion_order() {
        let registry = CallableRegistry::new();
        let mut completers: VecDeque<Completer> = VecDeque::new();
        let mut ops = Vec::new();
        for i in 0..3 {
            let (op, completer) = AsyncOperation::pending();
            ops.push(Admission::new(op, ResultType::Int, registry.register(i)));
            completers.push_back(completer);
        }

        // Settle in reverse submission order from another thread once all
        // three are admitted.
        let settle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let mut value = 100;
            while let Some(completer) = completers.pop_back() {
                completer.succeed(OperationValue::Int(value));
                value += 1;
                thread::sleep(Duration::from_millis(10));
            }
        });

        let mut ops = ops.into_iter();
        let mut seen = Vec::new();
        let report = BoundedScheduler::new(3)
            .run(
                || Ok::<_, String>(ops.next()),
                |done: Completion<CallableHandle<i32>>| {
                    let id = done.callback.take().unwrap();
                    seen.push((id, done.result.unwrap()));
                    Ok(())
                },
            )
            .unwrap();
        settle.join().unwrap();

        assert_eq!(
            seen,
            vec![
                (2, Some(OperationValue::Int(100))),
                (1, Some(OperationValue::Int(101))),
                (0, Some(OperationValue::Int(102))),
            ]
        );
        assert_eq!(report.dispatched, 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn outstanding_never_exceeds_limit() {
        let registry = CallableRegistry::new();
        let launched = Cell::new(0usize);
        let dispatched = Cell::new(0usize);
        let mut remaining: i32 = 12;

        let report = BoundedScheduler::new(3)
            .run(
                || {
                    if remaining == 0 {
                        return Ok::<_, String>(None);
                    }
                    // Asked only while a slot is free.
                    assert!(launched.get() - dispatched.get() < 3);
                    remaining -= 1;
                    launched.set(launched.get() + 1);
                    Ok(Some(Admission::new(
                        sleeper(5 + (remaining as u64 % 4) * 5, remaining),
                        ResultType::Int,
                        registry.register(()),
                    )))
                },
                |done| {
                    assert!(launched.get() - dispatched.get() <= 3);
                    dispatched.set(dispatched.get() + 1);
                    done.callback.release();
                    Ok(())
                },
            )
            .unwrap();

        assert_eq!(report.peak_outstanding, 3);
        assert_eq!(report.admitted, 12);
        assert_eq!(report.dispatched, 12);
        assert!(registry.is_empty());
    }

    #[test]
    fn producer_failure_still_drains_launched_operations() {
        let registry = CallableRegistry::new();
        let mut pulls = 0;
        let mut fired = Vec::new();

        let result = BoundedScheduler::new(8).run(
            || {
                pulls += 1;
                if pulls == 4 {
                    return Err("producer exploded".to_string());
                }
                Ok(Some(Admission::new(
                    sleeper(10, pulls),
                    ResultType::Int,
                    registry.register(pulls),
                )))
            },
            |done| {
                fired.push(done.callback.take().unwrap());
                Ok(())
            },
        );

        assert_eq!(result.unwrap_err(), "producer exploded");
        fired.sort();
        assert_eq!(fired, vec![1, 2, 3]);
        assert!(registry.is_empty());
    }

    #[test]
    fn first_callback_failure_wins_and_the_rest_drain() {
        let registry = CallableRegistry::new();
        let mut pulls = 0;
        let mut calls = 0;

        let result = BoundedScheduler::new(4).run(
            || {
                pulls += 1;
                if pulls > 4 {
                    return Ok(None);
                }
                Ok(Some(Admission::new(
                    sleeper(5 * pulls as u64, pulls),
                    ResultType::Int,
                    registry.register(pulls),
                )))
            },
            |done| {
                calls += 1;
                let id = done.callback.take().unwrap();
                Err(format!("callback {id} failed"))
            },
        );

        assert_eq!(result.unwrap_err(), "callback 1 failed");
        assert_eq!(calls, 4);
        assert!(registry.is_empty());
    }

    #[test]
    fn callback_failure_at_capacity_stops_pulling() {
        let registry = CallableRegistry::new();
        let mut pulls = 0;
        let mut calls = 0;

        let result = BoundedScheduler::new(1).run(
            || {
                pulls += 1;
                Ok(Some(Admission::new(
                    AsyncOperation::ready(Ok(OperationValue::Void)),
                    ResultType::Void,
                    registry.register(pulls),
                )))
            },
            |done| {
                calls += 1;
                done.callback.release();
                Err("stop".to_string())
            },
        );

        assert_eq!(result.unwrap_err(), "stop");
        // Pull 1 fills the only slot; its failing dispatch ends admission
        // before the producer is asked again.
        assert_eq!(pulls, 1);
        assert_eq!(calls, 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn operation_failure_reaches_the_callback() {
        let registry = CallableRegistry::new();
        let mut ops = vec![Admission::new(
            AsyncOperation::ready(Err(OperationError::failed("disk on fire"))),
            ResultType::Int,
            registry.register(()),
        )]
        .into_iter();
        let mut errors = Vec::new();

        BoundedScheduler::default()
            .run(
                || Ok::<_, String>(ops.next()),
                |done| {
                    done.callback.release();
                    errors.push(done.result.unwrap_err());
                    Ok(())
                },
            )
            .unwrap();

        assert_eq!(errors, vec![OperationError::failed("disk on fire")]);
    }

    #[test]
    fn fan_out_launches_lazily_and_respects_limit() {
        let registry = CallableRegistry::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<_> = (0..5)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                Job::new(
                    move || {
                        AsyncOperation::spawn_thread("job", move || -> Outcome {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(15));
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok(OperationValue::Int(i))
                        })
                    },
                    ResultType::Int,
                    registry.register(i),
                )
            })
            .collect();

        let mut order = Vec::new();
        let report = BoundedScheduler::new(2)
            .run_fan_out(jobs, |done| {
                order.push(done.sequence);
                done.callback.release();
                Ok::<_, String>(())
            })
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(report.admitted, 5);
        order.sort();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(registry.is_empty());
    }

    fn launch_order(limit: usize, durations: &[u64]) -> Vec<usize> {
        let registry = CallableRegistry::new();
        let launches = Rc::new(RefCell::new(Vec::new()));

        let jobs: Vec<_> = durations
            .iter()
            .enumerate()
            .map(|(i, &ms)| {
                let launches = Rc::clone(&launches);
                Job::new(
                    move || {
                        launches.borrow_mut().push(i);
                        sleeper(ms, i as i32)
                    },
                    ResultType::Int,
                    registry.register(i),
                )
            })
            .collect();

        BoundedScheduler::new(limit)
            .run_fan_out(jobs, |done| {
                done.callback.release();
                Ok::<_, String>(())
            })
            .unwrap();
        assert!(registry.is_empty());
        let order = launches.borrow().clone();
        order
    }

    #[test]
    fn fan_out_refills_in_list_order() {
        assert_eq!(launch_order(1, &[10, 1, 5, 1]), vec![0, 1, 2, 3]);
        // The short second job frees its slot first, but the refill still
        // takes jobs from the front of the remaining list.
        assert_eq!(launch_order(2, &[40, 1, 30, 1, 1, 1]), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn huge_limit_allocates_only_what_is_outstanding() {
        let registry = CallableRegistry::new();
        let mut remaining = 4;

        let report = BoundedScheduler::new(1 << 40)
            .run(
                || {
                    if remaining == 0 {
                        return Ok::<_, String>(None);
                    }
                    remaining -= 1;
                    Ok(Some(Admission::new(
                        sleeper(5, remaining),
                        ResultType::Int,
                        registry.register(remaining),
                    )))
                },
                |done| {
                    done.callback.release();
                    Ok(())
                },
            )
            .unwrap();

        assert_eq!(report.admitted, 4);
        assert_eq!(report.peak_outstanding, 4);
        assert!(registry.is_empty());
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut slots: Slots<()> = Slots::new(2);
        let mut report = RunReport::default();
        for value in 0..5 {
            if slots.is_full() {
                slots.wait_next().unwrap();
            }
            slots.admit(
                Admission::new(AsyncOperation::ready(Ok(OperationValue::Int(value))), ResultType::Int, ()),
                &mut report,
            );
        }
        assert_eq!(slots.entries.len(), 2);
        assert_eq!(report.peak_outstanding, 2);
    }

    #[test]
    fn fan_out_failure_never_launches_remaining_jobs() {
        let registry = CallableRegistry::new();
        let launched = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<_> = (0..6)
            .map(|i| {
                let launched = Arc::clone(&launched);
                Job::new(
                    move || {
                        launched.fetch_add(1, Ordering::SeqCst);
                        AsyncOperation::ready(Ok(OperationValue::Int(i)))
                    },
                    ResultType::Int,
                    registry.register(i),
                )
            })
            .collect();

        let result = BoundedScheduler::new(2).run_fan_out(jobs, |done| {
            done.callback.release();
            Err("batch callback threw".to_string())
        });

        assert_eq!(result.unwrap_err(), "batch callback threw");
        assert_eq!(launched.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn callbacks_never_overlap() {
        let registry = CallableRegistry::new();
        let in_callback = Cell::new(false);
        let mut remaining: i32 = 20;

        BoundedScheduler::new(6)
            .run(
                || {
                    assert!(!in_callback.get());
                    if remaining == 0 {
                        return Ok::<_, String>(None);
                    }
                    remaining -= 1;
                    Ok(Some(Admission::new(
                        sleeper((remaining % 3) as u64, remaining),
                        ResultType::Int,
                        registry.register(remaining),
                    )))
                },
                |done| {
                    assert!(!in_callback.replace(true));
                    done.callback.release();
                    in_callback.set(false);
                    Ok(())
                },
            )
            .unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn zero_limit_is_clamped() {
        assert_eq!(BoundedScheduler::new(0).limit(), 1);
        assert_eq!(BoundedScheduler::default().limit(), DEFAULT_CONCURRENCY);
    }
}
