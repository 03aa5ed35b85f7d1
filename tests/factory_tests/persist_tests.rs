//! Tests for persistence framing and resume
//!
//! These tests verify:
//! - Persist/resume round trips whole decorator stacks across "restarts"
//! - Pending disposals re-register with the new process's tracker
//! - Missing secret, tracker, or file fails with a resume error
//! - Corrupt frames fail with a format error
//! - resume_all isolates per-frame failures

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use vessel::container::{read_all, write_all, FileContainer, FileOptions, MemoryContainer};
use vessel::crypto::MasterSecret;
use vessel::disposal::{CommitTracker, InMemoryCommitTracker};
use vessel::persist::{self, decode_frame, restore_container, RestoreContext, FRAME_HEADER_SIZE};
use vessel::{Config, Container, ContainerFactory, ContainerKind, ErrorKind};

// =============================================================================
// Helper Functions
// =============================================================================

fn secret() -> MasterSecret {
    MasterSecret::from_bytes([0x42; 32])
}

/// A factory as a freshly started process would build it
fn start_process(dir: &Path, encrypt: bool, pad: bool) -> (ContainerFactory, Arc<InMemoryCommitTracker>) {
    let tracker = Arc::new(InMemoryCommitTracker::new(1));
    let config = Config::builder().temp_dir(dir).encrypt(encrypt).pad(pad).build();
    let factory = ContainerFactory::open(config)
        .unwrap()
        .with_secret(secret())
        .with_tracker(Arc::clone(&tracker) as Arc<dyn CommitTracker>);
    (factory, tracker)
}

fn file_count(dir: &Path) -> usize {
    fs::read_dir(dir).unwrap().count()
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_resume_full_stack_after_restart() {
    let temp = TempDir::new().unwrap();

    let frame = {
        let (factory, _tracker) = start_process(temp.path(), true, true);
        let container = factory.make_persistent_container().unwrap();
        write_all(container.as_ref(), b"survives the restart").unwrap();
        container.persist().unwrap()
    };
    assert_eq!(file_count(temp.path()), 1);

    let (factory, _tracker) = start_process(temp.path(), false, false);
    let resumed = factory.resume(&frame).unwrap();
    assert_eq!(resumed.kind(), ContainerKind::DelayedDisposal);
    assert_eq!(resumed.size(), 20);
    assert_eq!(read_all(resumed.as_ref()).unwrap(), b"survives the restart");
}

#[test]
fn test_describe_lists_layers() {
    let temp = TempDir::new().unwrap();
    let (factory, _tracker) = start_process(temp.path(), true, true);
    let container = factory.make_persistent_container().unwrap();
    write_all(container.as_ref(), b"abc").unwrap();

    let layers = persist::describe(&container.persist().unwrap()).unwrap();
    assert_eq!(layers.len(), 4);
    assert!(layers[0].starts_with("delayed-disposal-container"));
    assert!(layers[1].starts_with("padded-container logical_size=3"));
    assert!(layers[2].starts_with("encrypted-container"));
    assert!(layers[3].starts_with("file-container"));
}

#[test]
fn test_resume_buffer_after_restart() {
    let temp = TempDir::new().unwrap();

    let frame = {
        let (factory, _tracker) = start_process(temp.path(), true, false);
        let buffer = factory.make_persistent_buffer(128).unwrap();
        buffer.pwrite(64, b"positional").unwrap();
        buffer.close().unwrap();
        buffer.persist().unwrap()
    };

    let (factory, _tracker) = start_process(temp.path(), false, false);
    let buffer = factory.resume_buffer(&frame).unwrap();
    assert_eq!(buffer.size(), 128);
    let mut out = [0u8; 10];
    buffer.pread(64, &mut out).unwrap();
    assert_eq!(&out, b"positional");
}

#[test]
fn test_container_frame_is_not_a_buffer() {
    let temp = TempDir::new().unwrap();
    let (factory, _tracker) = start_process(temp.path(), false, false);
    let container = factory.make_persistent_container().unwrap();

    let err = factory.resume_buffer(&container.persist().unwrap()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
}

#[test]
fn test_resumed_persistent_file_not_deleted_on_exit() {
    let temp = TempDir::new().unwrap();
    let frame = {
        let (factory, _tracker) = start_process(temp.path(), false, false);
        let container = factory.make_persistent_container().unwrap();
        write_all(container.as_ref(), b"long lived").unwrap();
        container.persist().unwrap()
    };

    {
        let (factory, _tracker) = start_process(temp.path(), false, false);
        let _resumed = factory.resume(&frame).unwrap();
    }
    assert_eq!(file_count(temp.path()), 1);
}

// =============================================================================
// Disposal Across Restart
// =============================================================================

#[test]
fn test_pending_disposal_reregisters() {
    let temp = TempDir::new().unwrap();

    let frame = {
        let (factory, tracker) = start_process(temp.path(), false, false);
        let container = factory.make_persistent_container().unwrap();
        write_all(container.as_ref(), b"delete me later").unwrap();
        container.dispose().unwrap();
        assert_eq!(tracker.pending_count(), 1);
        // Simulated crash: the tracker's registration is lost, the frame is not
        container.persist().unwrap()
    };
    assert_eq!(file_count(temp.path()), 1);

    let (factory, tracker) = start_process(temp.path(), false, false);
    let resumed = factory.resume(&frame).unwrap();
    assert!(resumed.is_disposed());
    assert_eq!(tracker.pending_count(), 1);
    assert_eq!(file_count(temp.path()), 1);

    tracker.confirm_commit(1);
    assert_eq!(file_count(temp.path()), 0);
}

#[test]
fn test_disposed_wrapper_cannot_persist() {
    let temp = TempDir::new().unwrap();
    let (factory, tracker) = start_process(temp.path(), false, false);
    let container = factory.make_persistent_container().unwrap();
    container.dispose().unwrap();
    tracker.confirm_commit(1);

    assert_eq!(container.persist().unwrap_err().kind(), ErrorKind::Resource);
}

// =============================================================================
// Resume Failure Tests
// =============================================================================

#[test]
fn test_missing_tracker_is_resume_error() {
    let temp = TempDir::new().unwrap();
    let (factory, _tracker) = start_process(temp.path(), false, false);
    let frame = factory.make_persistent_container().unwrap().persist().unwrap();

    let ctx = RestoreContext::default();
    assert_eq!(restore_container(&frame, &ctx).unwrap_err().kind(), ErrorKind::Resume);
}

#[test]
fn test_missing_secret_is_resume_error() {
    let temp = TempDir::new().unwrap();
    let (factory, tracker) = start_process(temp.path(), true, false);
    let frame = factory.make_persistent_container().unwrap().persist().unwrap();

    let ctx = RestoreContext {
        tracker: Some(tracker as Arc<dyn CommitTracker>),
        ..RestoreContext::default()
    };
    assert_eq!(restore_container(&frame, &ctx).unwrap_err().kind(), ErrorKind::Resume);
}

#[test]
fn test_vanished_file_is_resume_error() {
    let temp = TempDir::new().unwrap();
    let (factory, _tracker) = start_process(temp.path(), false, false);
    let container = factory.make_persistent_container().unwrap();
    let frame = container.persist().unwrap();

    for entry in fs::read_dir(temp.path()).unwrap() {
        fs::remove_file(entry.unwrap().path()).unwrap();
    }
    assert_eq!(factory.resume(&frame).unwrap_err().kind(), ErrorKind::Resume);
}

#[test]
fn test_memory_container_cannot_persist() {
    assert_eq!(MemoryContainer::new().persist().unwrap_err().kind(), ErrorKind::Resource);
}

// =============================================================================
// Frame Format Tests
// =============================================================================

fn sample_frame(dir: &Path) -> Vec<u8> {
    let container = FileContainer::new(dir.join("framed.bin"), FileOptions::default());
    container.persist().unwrap()
}

#[test]
fn test_plain_file_frame_round_trip() {
    let temp = TempDir::new().unwrap();
    let container = FileContainer::new(temp.path().join("framed.bin"), FileOptions::default());
    write_all(&container, b"plain").unwrap();

    let resumed = restore_container(&container.persist().unwrap(), &RestoreContext::default()).unwrap();
    assert_eq!(read_all(resumed.as_ref()).unwrap(), b"plain");
}

#[test]
fn test_corrupt_payload_is_format_error() {
    let temp = TempDir::new().unwrap();
    let mut frame = sample_frame(temp.path());
    let last = frame.len() - 1;
    frame[last] ^= 0xff;

    assert_eq!(decode_frame(&frame).unwrap_err().kind(), ErrorKind::Format);
}

#[test]
fn test_truncated_frame_is_format_error() {
    let temp = TempDir::new().unwrap();
    let frame = sample_frame(temp.path());

    assert_eq!(decode_frame(&frame[..FRAME_HEADER_SIZE - 1]).unwrap_err().kind(), ErrorKind::Format);
    assert_eq!(decode_frame(&frame[..frame.len() - 1]).unwrap_err().kind(), ErrorKind::Format);
}

#[test]
fn test_unknown_magic_and_version_are_format_errors() {
    let temp = TempDir::new().unwrap();

    let mut bad_magic = sample_frame(temp.path());
    bad_magic[0] = b'X';
    assert_eq!(decode_frame(&bad_magic).unwrap_err().kind(), ErrorKind::Format);

    let mut bad_version = sample_frame(temp.path());
    bad_version[7] = 9;
    assert_eq!(decode_frame(&bad_version).unwrap_err().kind(), ErrorKind::Format);
}

// =============================================================================
// resume_all Tests
// =============================================================================

#[test]
fn test_resume_all_isolates_failures() {
    let temp = TempDir::new().unwrap();
    let (factory, _tracker) = start_process(temp.path(), false, false);

    let good = factory.make_persistent_container().unwrap();
    write_all(good.as_ref(), b"good").unwrap();
    let good_frame = good.persist().unwrap();

    let doomed = FileContainer::new(
        temp.path().join("doomed.bin"),
        FileOptions {
            mode: vessel::container::CreateMode::MustExist,
            ..FileOptions::default()
        },
    );
    let doomed_frame = doomed.persist().unwrap();

    let frames = vec![good_frame.clone(), b"garbage".to_vec(), doomed_frame, good_frame];
    let results = factory.resume_all(&frames);

    assert_eq!(results.len(), 4);
    assert!(results[0].is_ok());
    assert_eq!(results[1].as_ref().unwrap_err().kind(), ErrorKind::Format);
    assert_eq!(results[2].as_ref().unwrap_err().kind(), ErrorKind::Resume);
    assert_eq!(read_all(results[3].as_ref().unwrap().as_ref()).unwrap(), b"good");
}
