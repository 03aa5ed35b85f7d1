//! Tests for delayed disposal
//!
//! These tests verify:
//! - dispose() leaves the file in place until a commit >= creation id is confirmed
//! - Repeated dispose() is a no-op
//! - Wrappers reject I/O once disposed
//! - Shadows dispose immediately and never delete shared storage
//! - Deletion callbacks may run on another thread

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use tempfile::TempDir;
use vessel::container::{read_all, write_all, FileBuffer, FileContainer, FileOptions};
use vessel::disposal::{
    CommitTracker, DelayedDisposalBuffer, DelayedDisposalContainer, DisposalState, InMemoryCommitTracker,
};
use vessel::{Container, ContainerKind, ErrorKind, RandomBuffer};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_tracked_file(start_commit: u64) -> (TempDir, PathBuf, Arc<InMemoryCommitTracker>, DelayedDisposalContainer) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("tracked.bin");
    let tracker = Arc::new(InMemoryCommitTracker::new(start_commit));
    let inner = FileContainer::new(
        &path,
        FileOptions {
            delete_on_dispose: true,
            ..FileOptions::default()
        },
    );
    let container = DelayedDisposalContainer::with_identity(
        Box::new(inner),
        "tracked",
        Arc::clone(&tracker) as Arc<dyn CommitTracker>,
    );
    write_all(&container, b"durable bytes").unwrap();
    (temp_dir, path, tracker, container)
}

// =============================================================================
// Ordering Tests
// =============================================================================

#[test]
fn test_file_survives_until_commit_confirmed() {
    let (_temp, path, tracker, container) = setup_tracked_file(5);
    assert_eq!(container.commit_id_at_creation(), 5);
    assert_eq!(container.kind(), ContainerKind::DelayedDisposal);

    container.dispose().unwrap();
    assert!(container.is_disposed());
    assert_eq!(container.state(), DisposalState::Pending);
    assert!(path.exists());
    assert!(tracker.is_pending("tracked"));

    tracker.confirm_commit(4);
    assert!(path.exists());

    tracker.confirm_commit(5);
    assert!(!path.exists());
    assert_eq!(container.state(), DisposalState::Disposed);
}

#[test]
fn test_later_commit_also_releases() {
    let (_temp, path, tracker, container) = setup_tracked_file(0);
    container.dispose().unwrap();

    let next = tracker.begin_commit();
    assert_eq!(tracker.confirm_commit(next), 1);
    assert!(!path.exists());
}

#[test]
fn test_second_dispose_is_noop() {
    let (_temp, path, tracker, container) = setup_tracked_file(1);
    container.dispose().unwrap();
    container.dispose().unwrap();
    assert_eq!(tracker.pending_count(), 1);

    assert_eq!(tracker.confirm_commit(1), 1);
    assert!(!path.exists());

    container.dispose().unwrap();
    assert_eq!(tracker.pending_count(), 0);
}

#[test]
fn test_io_rejected_after_dispose() {
    let (_temp, _path, _tracker, container) = setup_tracked_file(0);
    container.dispose().unwrap();

    assert_eq!(container.input_stream().unwrap_err().kind(), ErrorKind::Resource);
    assert_eq!(container.output_stream().unwrap_err().kind(), ErrorKind::Resource);
    assert!(container.create_shadow().is_err());
    assert!(container.to_random_buffer().is_err());
}

#[test]
fn test_deletion_runs_on_commit_thread() {
    let (_temp, path, tracker, container) = setup_tracked_file(2);
    container.dispose().unwrap();
    drop(container);

    let committer = Arc::clone(&tracker);
    let handle = thread::spawn(move || committer.confirm_commit(2));
    assert_eq!(handle.join().unwrap(), 1);
    assert!(!path.exists());
}

#[test]
fn test_undisposed_container_stays_usable() {
    let (_temp, path, tracker, container) = setup_tracked_file(0);
    tracker.confirm_commit(10);

    assert!(path.exists());
    assert_eq!(container.state(), DisposalState::Active);
    assert_eq!(read_all(&container).unwrap(), b"durable bytes");
}

// =============================================================================
// Shadow Tests
// =============================================================================

#[test]
fn test_shadow_dispose_is_immediate_and_harmless() {
    let (_temp, path, tracker, container) = setup_tracked_file(0);

    let shadow = container.create_shadow().unwrap().unwrap();
    assert!(shadow.is_read_only());
    assert_eq!(read_all(shadow.as_ref()).unwrap(), b"durable bytes");

    shadow.dispose().unwrap();
    assert!(shadow.is_disposed());
    assert_eq!(tracker.pending_count(), 0);
    assert!(path.exists());
    assert_eq!(read_all(&container).unwrap(), b"durable bytes");
}

// =============================================================================
// Buffer Tests
// =============================================================================

#[test]
fn test_buffer_deferred_disposal() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("buffer.bin");
    let tracker = Arc::new(InMemoryCommitTracker::new(3));
    let buffer = DelayedDisposalBuffer::new(
        Box::new(FileBuffer::create(&path, 16, true).unwrap()),
        Arc::clone(&tracker) as Arc<dyn CommitTracker>,
    );
    buffer.pwrite(0, b"sixteen bytes!!!").unwrap();

    buffer.dispose().unwrap();
    assert!(path.exists());
    let mut out = [0u8; 4];
    assert!(buffer.pread(0, &mut out).is_err());

    tracker.confirm_commit(3);
    assert!(!path.exists());
    assert_eq!(buffer.state(), DisposalState::Disposed);
}

#[test]
fn test_conversion_keeps_deferral() {
    let (_temp, path, tracker, container) = setup_tracked_file(0);

    let view = container.to_random_buffer().unwrap();
    assert_eq!(view.kind(), ContainerKind::DelayedDisposal);
    assert_eq!(view.size(), 13);

    // The container gave its deletion rights to the view
    container.dispose().unwrap();
    tracker.confirm_commit(0);
    assert!(path.exists());

    view.dispose().unwrap();
    assert!(path.exists());
    tracker.confirm_commit(0);
    assert!(!path.exists());
}
