//! Integration tests for the task processor

use filament_engine::scheduler::{
    CancellationReason, OverloadAction, StepOutcome, TaskContext, TaskProcessor,
    TaskProcessorConfig, WakeupSource,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_processor(name: &str, workers: usize) -> TaskProcessor {
    TaskProcessor::new(TaskProcessorConfig {
        name: name.to_string(),
        worker_threads: workers,
        thread_name: "fe-test".to_string(),
        ..Default::default()
    })
}

#[test]
fn test_baseline_dispatch() {
    init_tracing();
    let processor = test_processor("baseline", 2);
    let executed = Arc::new(AtomicUsize::new(0));

    for _ in 0..1000 {
        let executed = executed.clone();
        let task = TaskContext::new(&processor, move |_ctx| {
            executed.fetch_add(1, Ordering::Relaxed);
            Ok(StepOutcome::Finished)
        });
        processor.schedule(task.clone());
        processor.adopt(task);
    }

    assert!(
        processor
            .task_counter()
            .wait_for_exhaustion(Duration::from_secs(5)),
        "all adopted tasks should drain"
    );

    assert_eq!(executed.load(Ordering::Relaxed), 1000);
    assert_eq!(processor.task_queue_size(), 0);

    let snapshot = processor.task_counter().snapshot();
    assert_eq!(snapshot.created, 1000);
    assert_eq!(snapshot.destroyed, 1000);
    assert_eq!(snapshot.alive, 0);
    assert_eq!(snapshot.overloaded, 0);
    assert_eq!(snapshot.cancelled_overload, 0);
}

#[test]
fn test_length_overload_cancels_excess_tasks() {
    init_tracing();
    let processor = test_processor("length-overload", 2);
    processor.set_max_task_queue_wait_length(4);
    processor.set_overload_action(OverloadAction::Cancel);

    // pin both workers inside a step so scheduled tasks stack up in the queue
    let entered = Arc::new(Barrier::new(3));
    let release = Arc::new(Barrier::new(3));
    let mut blockers = Vec::new();
    for _ in 0..2 {
        let entered = entered.clone();
        let release = release.clone();
        let blocker = TaskContext::new(&processor, move |_ctx| {
            entered.wait();
            release.wait();
            Ok(StepOutcome::Finished)
        });
        processor.schedule(blocker.clone());
        blockers.push(blocker);
    }
    entered.wait();

    let executed = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for _ in 0..10 {
        let executed = executed.clone();
        let task = TaskContext::new(&processor, move |_ctx| {
            executed.fetch_add(1, Ordering::Relaxed);
            Ok(StepOutcome::Finished)
        });
        processor.schedule(task.clone());
        tasks.push(task);
    }
    let critical_executed = executed.clone();
    let critical = TaskContext::new_critical(&processor, move |_ctx| {
        critical_executed.fetch_add(1, Ordering::Relaxed);
        Ok(StepOutcome::Finished)
    });
    processor.schedule(critical.clone());

    release.wait();
    for task in tasks.iter().chain([&critical]) {
        assert!(task.wait_finished(Duration::from_secs(1)));
    }

    // the queue was over the limit from the 5th task on
    for task in &tasks[..4] {
        assert_eq!(task.cancellation_reason(), None);
    }
    for task in &tasks[4..] {
        assert_eq!(
            task.cancellation_reason(),
            Some(CancellationReason::Overload)
        );
    }
    assert_eq!(critical.cancellation_reason(), None);

    // 4 uncancelled + the critical one ran their bodies
    assert_eq!(executed.load(Ordering::Relaxed), 5);

    let snapshot = processor.task_counter().snapshot();
    assert_eq!(snapshot.overloaded, 6);
    assert_eq!(snapshot.cancelled_overload, 6);

    drop(blockers);
    drop(tasks);
    drop(critical);
}

#[test]
fn test_latency_overload_with_sparse_sampling() {
    init_tracing();
    let processor = test_processor("latency-overload", 1);
    processor.set_max_task_queue_wait_time(Duration::from_millis(25));
    processor.set_overload_action(OverloadAction::Cancel);

    // One timestamp is sampled per 16 schedules on a thread: index 0 and
    // index 16 carry real timepoints, the rest the unknown sentinel. Index 16
    // is critical: its measured latency must update the verdict without the
    // task itself being cancelled.
    let executed = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for index in 0..32usize {
        let executed = executed.clone();
        let body = move |_ctx: &Arc<TaskContext>| {
            thread::sleep(Duration::from_millis(50));
            executed.lock().push(index);
            Ok(StepOutcome::Finished)
        };
        let task = if index == 16 {
            TaskContext::new_critical(&processor, body)
        } else {
            TaskContext::new(&processor, body)
        };
        processor.schedule(task.clone());
        tasks.push(task);
    }

    for task in &tasks {
        assert!(task.wait_finished(Duration::from_secs(10)));
    }

    // indexes 0..=15 were judged by index 0's fast dequeue; index 16 measured
    // its real wait and flipped the verdict; 17..=31 inherited it
    assert_eq!(*executed.lock(), (0..=16).collect::<Vec<_>>());
    for task in &tasks[..16] {
        assert_eq!(task.cancellation_reason(), None);
    }
    assert_eq!(tasks[16].cancellation_reason(), None);
    for task in &tasks[17..] {
        assert_eq!(
            task.cancellation_reason(),
            Some(CancellationReason::Overload)
        );
    }

    let snapshot = processor.task_counter().snapshot();
    assert_eq!(snapshot.overloaded, 16);
    assert_eq!(snapshot.cancelled_overload, 15);
    assert!(processor.queue_wait_time_overloaded());

    // disabling the threshold clears the verdict on the next dequeue
    processor.set_max_task_queue_wait_time(Duration::ZERO);
    let reset_probe = TaskContext::new(&processor, |_ctx| Ok(StepOutcome::Finished));
    processor.schedule(reset_probe.clone());
    assert!(reset_probe.wait_finished(Duration::from_secs(1)));
    assert!(!processor.queue_wait_time_overloaded());

    drop(tasks);
    drop(reset_probe);
}

#[test]
fn test_adopt_then_finish_race() {
    init_tracing();
    let processor = test_processor("adopt-race", 2);

    for round in 0..200 {
        let task = TaskContext::new(&processor, |_ctx| Ok(StepOutcome::Finished));
        if round % 2 == 0 {
            processor.schedule(task.clone());
            processor.adopt(task);
        } else {
            processor.adopt(task.clone());
            processor.schedule(task);
        }
    }

    // whichever side of the race each round took, nothing may leak
    assert!(processor
        .task_counter()
        .wait_for_exhaustion(Duration::from_secs(5)));
    let snapshot = processor.task_counter().snapshot();
    assert_eq!(snapshot.created, 200);
    assert_eq!(snapshot.destroyed, 200);
}

#[test]
fn test_fifo_per_producer() {
    init_tracing();
    let processor = test_processor("fifo", 1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut expected = Vec::new();
    let mut tasks = Vec::new();
    for _ in 0..100 {
        let order = order.clone();
        let task = TaskContext::new(&processor, move |ctx| {
            order.lock().push(ctx.id().as_u64());
            Ok(StepOutcome::Finished)
        });
        expected.push(task.id().as_u64());
        processor.schedule(task.clone());
        tasks.push(task);
    }

    for task in &tasks {
        assert!(task.wait_finished(Duration::from_secs(2)));
    }
    assert_eq!(*order.lock(), expected);
    drop(tasks);
}

#[test]
fn test_no_double_dispatch_for_yielding_tasks() {
    init_tracing();
    let processor = test_processor("yield", 4);
    let violations = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    let mut step_counters = Vec::new();
    for _ in 0..8 {
        let violations = violations.clone();
        let steps = Arc::new(AtomicUsize::new(0));
        let in_step = Arc::new(AtomicBool::new(false));
        let observed_steps = steps.clone();
        let mut remaining = 50usize;
        let task = TaskContext::new(&processor, move |ctx| {
            if in_step.swap(true, Ordering::SeqCst) {
                violations.fetch_add(1, Ordering::Relaxed);
            }
            observed_steps.fetch_add(1, Ordering::Relaxed);
            let outcome = if remaining == 0 {
                StepOutcome::Finished
            } else {
                remaining -= 1;
                ctx.wakeup(WakeupSource::DeadlineTimer);
                StepOutcome::Suspended
            };
            in_step.store(false, Ordering::SeqCst);
            Ok(outcome)
        });
        processor.schedule(task.clone());
        tasks.push(task);
        step_counters.push(steps);
    }

    for task in &tasks {
        assert!(task.wait_finished(Duration::from_secs(5)));
    }
    assert_eq!(violations.load(Ordering::Relaxed), 0);
    for steps in &step_counters {
        // 50 yielding steps plus the terminal one
        assert_eq!(steps.load(Ordering::Relaxed), 51);
    }
    drop(tasks);
}

#[test]
fn test_shutdown_during_schedule() {
    init_tracing();
    let processor = test_processor("shutdown-race", 2);
    let executed = Arc::new(AtomicUsize::new(0));

    let mut contexts = Vec::new();
    for _ in 0..100 {
        let executed = executed.clone();
        contexts.push(TaskContext::new(&processor, move |_ctx| {
            executed.fetch_add(1, Ordering::Relaxed);
            Ok(StepOutcome::Finished)
        }));
    }

    let (halfway_tx, halfway_rx) = mpsc::channel();
    let scheduler_thread = thread::spawn(move || {
        let mut reasons = Vec::new();
        for (index, context) in contexts.into_iter().enumerate() {
            // first wakeup of a fresh context is its initial schedule
            context.wakeup(WakeupSource::DeadlineTimer);
            reasons.push(context.cancellation_reason());
            drop(context);
            if index == 49 {
                halfway_tx.send(()).unwrap();
            }
        }
        reasons
    });

    halfway_rx.recv().unwrap();
    drop(processor);

    let reasons = scheduler_thread.join().unwrap();
    assert_eq!(reasons.len(), 100);

    let ran = executed.load(Ordering::Relaxed);
    let cancelled = reasons
        .iter()
        .filter(|reason| **reason == Some(CancellationReason::Shutdown))
        .count();
    for reason in &reasons {
        assert!(matches!(reason, None | Some(CancellationReason::Shutdown)));
    }
    // every enqueued task either ran its body or was pre-cancelled
    assert_eq!(ran + cancelled, 100);
}
