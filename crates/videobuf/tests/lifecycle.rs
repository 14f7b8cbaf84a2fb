// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies
//
// Queue Lifecycle Tests
//
// TESTING LAYERS:
//
// Layer 1 (Deterministic - completions driven by the test):
//   - allocation limits, busy rules and streaming preconditions
//   - FIFO delivery by completion order, fixed and randomised
//   - double submission, one-shot user pointers, cancellation idempotence
//   - list membership against buffer state under random operation mixes
//
// Layer 2 (Blocking - a helper thread completes or cancels):
//   - blocking dequeue released by completion, streamoff and interrupt
//
// RUN:
//   cargo test -p videobuf --test lifecycle

use rand::{seq::SliceRandom, Rng};
use serial_test::serial;
use std::{sync::Arc, thread, time::Duration};
use videobuf::{
    backend::HeapBackend,
    buffer::{BufferState, MemoryModel, UserPtr},
    fourcc::FourCC,
    vivid::{DeviceConfig, VirtualDevice},
    Error, Queue, QueueConfig, PAGE_SIZE, VIDEO_MAX_FRAME,
};

type TestQueue = Queue<Arc<VirtualDevice>, HeapBackend>;

/// 100-byte GREY frames.
fn device() -> Arc<VirtualDevice> {
    Arc::new(VirtualDevice::new(
        DeviceConfig::default()
            .with_resolution(100, 1)
            .with_format(FourCC::GREY)
            .with_min_buffers(1),
    ))
}

fn queue() -> (Arc<VirtualDevice>, Arc<TestQueue>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = device();
    let config = QueueConfig::default().with_wait_interval(Duration::from_millis(2));
    let queue = Arc::new(Queue::new(config, Arc::clone(&device), HeapBackend::new()));
    (device, queue)
}

fn states(queue: &TestQueue) -> Vec<BufferState> {
    (0..queue.count())
        .map(|index| queue.query(index).unwrap().state)
        .collect()
}

#[test]
fn test_dequeue_follows_completion_order() {
    let (_device, queue) = queue();
    assert_eq!(queue.reqbufs(4, MemoryModel::Mapped).unwrap(), 4);
    for index in 0..4 {
        queue.qbuf(index, MemoryModel::Mapped, None).unwrap();
    }
    queue.streamon().unwrap();

    let completer = queue.completer();
    for index in [2, 0, 3, 1] {
        completer.complete(index).unwrap();
    }

    let order: Vec<u32> = (0..4).map(|_| queue.dqbuf(true).unwrap().index).collect();
    assert_eq!(order, vec![2, 0, 3, 1]);
    assert!(matches!(queue.dqbuf(true), Err(Error::WouldBlock)));
}

#[test]
fn test_random_completion_orders_are_fifo() {
    let (_device, queue) = queue();
    let count = queue.reqbufs(8, MemoryModel::Mapped).unwrap();
    let completer = queue.completer();
    let mut rng = rand::rng();
    let mut last_sequence = None;

    for round in 0..20 {
        for index in 0..count {
            queue.qbuf(index, MemoryModel::Mapped, None).unwrap();
        }
        if round == 0 {
            queue.streamon().unwrap();
        }

        let mut order: Vec<u32> = (0..count).collect();
        order.shuffle(&mut rng);
        for &index in &order {
            if index % 3 == 0 {
                completer.start(index).unwrap();
            }
            completer.complete(index).unwrap();
        }

        for &expected in &order {
            let info = queue.dqbuf(true).unwrap();
            assert_eq!(info.index, expected);
            assert_eq!(info.state, BufferState::Done);
            if let Some(last) = last_sequence {
                assert_eq!(info.sequence, last + 1);
            }
            last_sequence = Some(info.sequence);
        }
    }
}

#[test]
fn test_mapped_round_trip() {
    let (_device, queue) = queue();
    assert_eq!(queue.reqbufs(2, MemoryModel::Mapped).unwrap(), 2);
    let region = queue.mmap_setup(0, 2 * PAGE_SIZE).unwrap();
    assert!(queue.query(0).unwrap().mapped);

    queue.qbuf(0, MemoryModel::Mapped, None).unwrap();
    queue.streamon().unwrap();

    let completer = queue.completer();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        completer.complete(0).unwrap();
    });

    let info = queue.dqbuf(false).unwrap();
    handle.join().unwrap();
    assert_eq!(info.index, 0);
    assert_eq!(info.state, BufferState::Done);
    assert!(info.timestamp.is_some());
    assert_eq!(queue.query(0).unwrap().state, BufferState::Prepared);

    queue.qbuf(0, MemoryModel::Mapped, None).unwrap();
    assert_eq!(queue.query(0).unwrap().state, BufferState::Queued);

    queue.streamoff();
    queue.unmap(&region).unwrap();
}

#[test]
fn test_double_enqueue_rejected() {
    let (_device, queue) = queue();
    queue.reqbufs(2, MemoryModel::Mapped).unwrap();
    queue.qbuf(1, MemoryModel::Mapped, None).unwrap();
    let before = queue.query(1).unwrap();

    assert!(matches!(
        queue.qbuf(1, MemoryModel::Mapped, None),
        Err(Error::InvalidState(_))
    ));
    let after = queue.query(1).unwrap();
    assert_eq!(before.state, after.state);
    assert_eq!(after.state, BufferState::Queued);

    // still exactly one pending entry: one completion, one dequeue
    let completer = queue.completer();
    completer.complete(1).unwrap();
    assert!(matches!(completer.complete(1), Err(Error::InvalidState(_))));
    assert_eq!(queue.dqbuf(true).unwrap().index, 1);
    assert!(matches!(queue.dqbuf(true), Err(Error::WouldBlock)));
}

#[test]
fn test_done_buffer_not_requeued_before_dequeue() {
    let (_device, queue) = queue();
    queue.reqbufs(1, MemoryModel::Mapped).unwrap();
    queue.qbuf(0, MemoryModel::Mapped, None).unwrap();
    queue.completer().complete(0).unwrap();
    assert!(matches!(
        queue.qbuf(0, MemoryModel::Mapped, None),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn test_error_frame_is_delivered_and_requeueable() {
    let (_device, queue) = queue();
    queue.reqbufs(2, MemoryModel::Mapped).unwrap();
    queue.qbuf(0, MemoryModel::Mapped, None).unwrap();
    queue.qbuf(1, MemoryModel::Mapped, None).unwrap();
    queue.streamon().unwrap();

    let completer = queue.completer();
    completer.fail(0).unwrap();
    completer.complete(1).unwrap();

    let bad = queue.dqbuf(true).unwrap();
    assert_eq!(bad.index, 0);
    assert_eq!(bad.state, BufferState::Error);
    assert!(!bad.is_done());
    assert!(queue.dqbuf(true).unwrap().is_done());

    queue.qbuf(0, MemoryModel::Mapped, None).unwrap();
}

#[test]
fn test_failed_buffer_not_requeued_before_dequeue() {
    let (_device, queue) = queue();
    queue.reqbufs(2, MemoryModel::Mapped).unwrap();
    queue.qbuf(0, MemoryModel::Mapped, None).unwrap();
    queue.streamon().unwrap();

    let completer = queue.completer();
    completer.fail(0).unwrap();
    assert!(matches!(
        queue.qbuf(0, MemoryModel::Mapped, None),
        Err(Error::InvalidState(_))
    ));
    assert!(completer.pending().is_empty());
    assert_eq!(completer.ready(), vec![0]);

    let bad = queue.dqbuf(true).unwrap();
    assert_eq!((bad.index, bad.state), (0, BufferState::Error));
    assert_eq!(queue.query(0).unwrap().state, BufferState::Prepared);

    queue.qbuf(0, MemoryModel::Mapped, None).unwrap();
    assert_eq!(completer.pending(), vec![0]);
    assert!(completer.ready().is_empty());
    completer.complete(0).unwrap();
    assert!(queue.dqbuf(true).unwrap().is_done());
}

/// Every allocated buffer sits on at most one list, and its state agrees
/// with where it sits.
fn assert_membership(queue: &TestQueue) {
    let completer = queue.completer();
    let pending = completer.pending();
    let ready = completer.ready();
    for index in 0..queue.count() {
        let on_pending = pending.iter().filter(|&&i| i == index).count();
        let on_ready = ready.iter().filter(|&&i| i == index).count();
        assert!(
            on_pending + on_ready <= 1,
            "buffer {} listed {} times",
            index,
            on_pending + on_ready
        );

        let state = queue.query(index).unwrap().state;
        if on_pending == 1 {
            assert!(state.is_in_flight(), "pending buffer {} is {}", index, state);
        } else if on_ready == 1 {
            assert!(state.is_complete(), "ready buffer {} is {}", index, state);
        } else {
            assert!(
                state.is_queueable(),
                "unlisted buffer {} is {}",
                index,
                state
            );
        }
    }
}

#[test]
fn test_random_operations_keep_list_membership() {
    let (_device, queue) = queue();
    let count = queue.reqbufs(6, MemoryModel::Mapped).unwrap();
    let completer = queue.completer();
    let mut rng = rand::rng();

    for _ in 0..2000 {
        match rng.random_range(0..10) {
            0..=2 => {
                let index = rng.random_range(0..count);
                let before = queue.query(index).unwrap().state;
                if queue.qbuf(index, MemoryModel::Mapped, None).is_err() {
                    assert_eq!(queue.query(index).unwrap().state, before);
                }
            }
            3 => {
                if let Some(&index) = completer.pending().first() {
                    let _ = completer.start(index);
                }
            }
            4 | 5 => {
                let pending = completer.pending();
                if !pending.is_empty() {
                    let index = pending[rng.random_range(0..pending.len())];
                    if rng.random_bool(0.25) {
                        completer.fail(index).unwrap();
                    } else {
                        completer.complete(index).unwrap();
                    }
                }
            }
            6 | 7 => {
                let head = completer.ready().first().copied();
                match queue.dqbuf(true) {
                    Ok(info) => assert_eq!(Some(info.index), head),
                    Err(err) => {
                        assert!(head.is_none());
                        assert!(matches!(err, Error::WouldBlock));
                    }
                }
            }
            8 => {
                let _ = queue.streamon();
            }
            _ => queue.streamoff(),
        }
        assert_membership(&queue);
    }

    queue.streamoff();
    assert_membership(&queue);
    assert!(completer.pending().is_empty());
    assert!(completer.ready().is_empty());
}

#[test]
fn test_streamoff_is_idempotent() {
    let (_device, queue) = queue();
    queue.reqbufs(4, MemoryModel::Mapped).unwrap();
    for index in 0..3 {
        queue.qbuf(index, MemoryModel::Mapped, None).unwrap();
    }
    queue.streamon().unwrap();
    let completer = queue.completer();
    completer.start(0).unwrap();
    completer.complete(1).unwrap();

    queue.streamoff();
    let once = states(&queue);
    queue.streamoff();
    let twice = states(&queue);
    assert_eq!(once, twice);
    // the undequeued frame is dropped, everything else is failed
    assert_eq!(
        once,
        vec![
            BufferState::Error,
            BufferState::Idle,
            BufferState::Error,
            BufferState::Error
        ]
    );
    assert!(!queue.is_streaming());
    assert!(!queue.poll_readiness());
    assert!(matches!(queue.dqbuf(true), Err(Error::WouldBlock)));

    // cancelled buffers go back in without reallocation
    queue.qbuf(0, MemoryModel::Mapped, None).unwrap();
    queue.streamon().unwrap();
}

#[test]
fn test_streaming_and_reading_are_exclusive() {
    let (_device, queue) = queue();
    queue.reqbufs(2, MemoryModel::Mapped).unwrap();
    queue.qbuf(0, MemoryModel::Mapped, None).unwrap();
    queue.streamon().unwrap();
    assert!(matches!(queue.read_start(), Err(Error::InvalidState(_))));
    let mut out = [0u8; 4];
    assert!(matches!(
        queue.read_one(&mut out, true),
        Err(Error::InvalidState(_))
    ));
    queue.stop();

    let (_device, queue) = self::queue();
    queue.read_start().unwrap();
    assert!(matches!(queue.streamon(), Err(Error::InvalidState(_))));
    assert!(matches!(
        queue.qbuf(0, MemoryModel::UserPointer, None),
        Err(Error::Busy)
    ));
    assert!(matches!(queue.dqbuf(true), Err(Error::Busy)));
    queue.stop();
    assert!(!queue.is_reading());
}

#[test]
fn test_streamon_preconditions() {
    let (_device, queue) = queue();
    assert!(matches!(queue.streamon(), Err(Error::InvalidState(_))));
    queue.reqbufs(2, MemoryModel::Mapped).unwrap();
    assert!(matches!(queue.streamon(), Err(Error::InvalidState(_))));
    queue.qbuf(0, MemoryModel::Mapped, None).unwrap();
    queue.streamon().unwrap();
    assert!(matches!(queue.streamon(), Err(Error::InvalidState(_))));
}

#[test]
fn test_reqbufs_busy_rules() {
    let (_device, queue) = queue();
    queue.reqbufs(2, MemoryModel::Mapped).unwrap();

    queue.qbuf(0, MemoryModel::Mapped, None).unwrap();
    assert!(matches!(queue.reqbufs(2, MemoryModel::Mapped), Err(Error::Busy)));
    queue.streamon().unwrap();
    assert!(matches!(queue.reqbufs(2, MemoryModel::Mapped), Err(Error::Busy)));
    queue.streamoff();

    let region = queue.mmap_setup(PAGE_SIZE, PAGE_SIZE).unwrap();
    assert!(matches!(queue.reqbufs(4, MemoryModel::Mapped), Err(Error::Busy)));
    assert!(queue.is_busy());
    queue.unmap(&region).unwrap();

    assert_eq!(queue.reqbufs(3, MemoryModel::UserPointer).unwrap(), 3);
    assert_eq!(queue.query(0).unwrap().memory, MemoryModel::UserPointer);
    assert_eq!(queue.reqbufs(0, MemoryModel::Mapped).unwrap(), 0);
    assert_eq!(queue.count(), 0);
    assert_eq!(queue.backend().allocated(), 0);
}

#[test]
fn test_reqbufs_clamps_to_capacity() {
    let (_device, queue) = queue();
    assert_eq!(
        queue.reqbufs(u32::MAX, MemoryModel::Mapped).unwrap(),
        VIDEO_MAX_FRAME as u32
    );
    let last = queue.query(VIDEO_MAX_FRAME as u32 - 1).unwrap();
    assert_eq!(last.boff, (VIDEO_MAX_FRAME - 1) * PAGE_SIZE);
}

#[test]
fn test_userptr_resubmission() {
    let (_device, queue) = queue();
    queue.reqbufs(1, MemoryModel::UserPointer).unwrap();
    queue.streamon().unwrap_err();

    queue
        .qbuf(0, MemoryModel::UserPointer, Some(UserPtr::new(0x1000, PAGE_SIZE)))
        .unwrap();
    queue.streamon().unwrap();
    queue.completer().complete(0).unwrap();
    let info = queue.dqbuf(true).unwrap();
    assert_eq!(info.baddr, Some(0x1000));
    assert_eq!(queue.query(0).unwrap().state, BufferState::NeedsInit);

    queue
        .qbuf(0, MemoryModel::UserPointer, Some(UserPtr::new(0x8000, 2 * PAGE_SIZE)))
        .unwrap();
    assert_eq!(queue.query(0).unwrap().baddr, Some(0x8000));
}

#[test]
fn test_waiton_single_buffer() {
    let (_device, queue) = queue();
    queue.reqbufs(2, MemoryModel::Mapped).unwrap();
    assert_eq!(queue.waiton(0, true).unwrap(), BufferState::NeedsInit);
    queue.qbuf(0, MemoryModel::Mapped, None).unwrap();
    assert!(matches!(queue.waiton(0, true), Err(Error::WouldBlock)));
    assert!(matches!(queue.waiton(7, true), Err(Error::InvalidIndex(7))));

    let completer = queue.completer();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        completer.fail(0).unwrap();
    });
    assert_eq!(queue.waiton(0, false).unwrap(), BufferState::Error);
    handle.join().unwrap();
}

#[test]
fn test_poll_readiness_streaming() {
    let (_device, queue) = queue();
    queue.reqbufs(2, MemoryModel::Mapped).unwrap();
    assert!(!queue.poll_readiness());
    queue.qbuf(0, MemoryModel::Mapped, None).unwrap();
    queue.streamon().unwrap();
    assert!(!queue.poll_readiness());
    queue.completer().complete(0).unwrap();
    assert!(queue.poll_readiness());
    queue.dqbuf(true).unwrap();
    assert!(!queue.poll_readiness());
}

#[test]
#[serial]
fn test_blocking_dequeue_released_by_streamoff() {
    let (_device, queue) = queue();
    queue.reqbufs(2, MemoryModel::Mapped).unwrap();
    queue.qbuf(0, MemoryModel::Mapped, None).unwrap();
    queue.streamon().unwrap();

    let consumer = Arc::clone(&queue);
    let handle = thread::spawn(move || consumer.dqbuf(false));
    thread::sleep(Duration::from_millis(50));
    queue.streamoff();

    let result = handle.join().unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[test]
#[serial]
fn test_blocking_dequeue_interrupted() {
    let (_device, queue) = queue();
    queue.reqbufs(1, MemoryModel::Mapped).unwrap();
    queue.qbuf(0, MemoryModel::Mapped, None).unwrap();
    queue.streamon().unwrap();

    let flag = queue.interrupt_flag();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        flag.store(true, std::sync::atomic::Ordering::Release);
    });
    assert!(matches!(queue.dqbuf(false), Err(Error::Interrupted)));
    handle.join().unwrap();

    queue.clear_interrupt();
    queue.completer().complete(0).unwrap();
    assert_eq!(queue.dqbuf(false).unwrap().index, 0);
}
