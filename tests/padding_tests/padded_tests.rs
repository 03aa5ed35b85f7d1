//! Tests for PaddedContainer and PaddedBuffer
//!
//! These tests verify:
//! - Physical size is max(MIN_PADDED_SIZE, next_pow2(L))
//! - Readers see exactly L bytes; size() reports L
//! - Padding composes over encryption
//! - Buffers clamp every access to the logical size

use std::io::{Read, Write};
use std::sync::Arc;

use proptest::prelude::*;
use tempfile::TempDir;
use vessel::container::{read_all, write_all, FileContainer, FileOptions, MemoryBuffer, MemoryContainer};
use vessel::crypto::{HkdfSha256, MasterSecret, HEADER_LEN};
use vessel::encrypted::EncryptedContainer;
use vessel::padded::{padded_size, PaddedBuffer, PaddedContainer, MIN_PADDED_SIZE};
use vessel::{Container, ContainerKind, ErrorKind, InputStream, RandomBuffer};

// =============================================================================
// Helper Functions
// =============================================================================

fn padded_memory() -> PaddedContainer {
    PaddedContainer::new(Box::new(MemoryContainer::new()))
}

// =============================================================================
// Size Rule Tests
// =============================================================================

#[test]
fn test_padded_size_rule() {
    assert_eq!(padded_size(0, MIN_PADDED_SIZE), 1024);
    assert_eq!(padded_size(1, MIN_PADDED_SIZE), 1024);
    assert_eq!(padded_size(1024, MIN_PADDED_SIZE), 1024);
    assert_eq!(padded_size(1025, MIN_PADDED_SIZE), 2048);
    assert_eq!(padded_size(5000, MIN_PADDED_SIZE), 8192);
    assert_eq!(padded_size(1 << 20, MIN_PADDED_SIZE), 1 << 20);
    assert_eq!(padded_size(3, 0), 4);
    assert_eq!(padded_size(u64::MAX, MIN_PADDED_SIZE), u64::MAX);
}

#[test]
fn test_small_payload_pads_to_minimum() {
    let container = padded_memory();
    write_all(&container, b"tiny").unwrap();

    assert_eq!(container.size(), 4);
    assert_eq!(container.physical_size(), 1024);
    assert_eq!(read_all(&container).unwrap(), b"tiny");
    assert_eq!(container.kind(), ContainerKind::Padded);
}

#[test]
fn test_large_payload_pads_to_next_power_of_two() {
    let data = vec![0xabu8; 5000];
    let container = padded_memory();
    write_all(&container, &data).unwrap();

    assert_eq!(container.size(), 5000);
    assert_eq!(container.physical_size(), 8192);
    assert_eq!(read_all(&container).unwrap(), data);
}

#[test]
fn test_custom_minimum() {
    let container = PaddedContainer::with_min_size(Box::new(MemoryContainer::new()), 64);
    write_all(&container, b"abc").unwrap();
    assert_eq!(container.physical_size(), 64);
}

#[test]
fn test_filler_not_visible_to_readers() {
    let container = padded_memory();
    write_all(&container, b"0123456789").unwrap();

    let mut input = container.input_stream().unwrap().unwrap();
    assert_eq!(input.available(), 10);
    assert_eq!(input.skip(100).unwrap(), 10);
    assert_eq!(input.available(), 0);

    let mut rest = Vec::new();
    input.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn test_rewrite_updates_logical_size() {
    let container = padded_memory();
    write_all(&container, &vec![1u8; 3000]).unwrap();
    write_all(&container, b"short").unwrap();

    assert_eq!(container.size(), 5);
    assert_eq!(container.physical_size(), 1024);
    assert_eq!(read_all(&container).unwrap(), b"short");
}

#[test]
fn test_dropped_stream_keeps_logical_size() {
    let container = padded_memory();
    write_all(&container, b"GOOD COMPLETE RECORD").unwrap();
    {
        let mut output = container.output_stream().unwrap();
        output.write_all(b"PA").unwrap();
    }

    assert_eq!(container.size(), 20);
    assert_eq!(container.physical_size(), 1024);
    assert_eq!(read_all(&container).unwrap(), b"GOOD COMPLETE RECORD");
}

// =============================================================================
// Composition Tests
// =============================================================================

#[test]
fn test_padding_over_encryption() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("padded.bin");
    let encrypted = EncryptedContainer::new(
        Box::new(FileContainer::new(&path, FileOptions::default())),
        &MasterSecret::from_bytes([9u8; 32]),
        Arc::new(HkdfSha256),
    )
    .unwrap();
    let container = PaddedContainer::new(Box::new(encrypted));

    write_all(&container, b"length is hidden").unwrap();

    assert_eq!(container.size(), 16);
    assert_eq!(container.physical_size(), 1024);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024 + HEADER_LEN as u64);
    assert_eq!(read_all(&container).unwrap(), b"length is hidden");
}

#[test]
fn test_shadow_shares_logical_size() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("shadowed.bin");
    let container = PaddedContainer::new(Box::new(FileContainer::new(&path, FileOptions::default())));
    write_all(&container, b"first").unwrap();

    let shadow = container.create_shadow().unwrap().unwrap();
    assert!(shadow.is_read_only());
    assert_eq!(read_all(shadow.as_ref()).unwrap(), b"first");
    assert!(shadow.output_stream().is_err());

    shadow.dispose().unwrap();
    assert_eq!(read_all(&container).unwrap(), b"first");
}

#[test]
fn test_memory_backed_has_no_shadow() {
    let container = padded_memory();
    write_all(&container, b"no shadow").unwrap();
    assert!(container.create_shadow().unwrap().is_none());
}

// =============================================================================
// PaddedBuffer Tests
// =============================================================================

#[test]
fn test_to_random_buffer_clamps_to_logical() {
    let container = padded_memory();
    write_all(&container, b"visible part").unwrap();

    let buffer = container.to_random_buffer().unwrap();
    assert_eq!(buffer.size(), 12);

    let mut out = [0u8; 4];
    buffer.pread(8, &mut out).unwrap();
    assert_eq!(&out, b"part");
    assert_eq!(buffer.pread(9, &mut out).unwrap_err().kind(), ErrorKind::Resource);
}

#[test]
fn test_buffer_requires_large_enough_inner() {
    let err = PaddedBuffer::new(Box::new(MemoryBuffer::new(10)), 11).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
}

#[test]
fn test_buffer_writes_within_logical_range() {
    let buffer = PaddedBuffer::new(Box::new(MemoryBuffer::new(1024)), 100).unwrap();
    assert_eq!(buffer.size(), 100);
    assert_eq!(buffer.physical_size(), 1024);

    buffer.pwrite(96, b"tail").unwrap();
    assert!(buffer.pwrite(97, b"tail").is_err());
}

#[test]
fn test_buffer_into_container_keeps_logical_size() {
    let inner = MemoryBuffer::new(1024);
    inner.pwrite(0, b"logical!").unwrap();
    let buffer = Box::new(PaddedBuffer::new(Box::new(inner), 8).unwrap());

    let container = buffer.into_container().unwrap();
    assert_eq!(container.size(), 8);
    assert_eq!(read_all(container.as_ref()).unwrap(), b"logical!");
}

// =============================================================================
// Property Tests
// =============================================================================

proptest! {
    #[test]
    fn prop_padding_invisible(data in proptest::collection::vec(any::<u8>(), 0..9000)) {
        let container = padded_memory();
        write_all(&container, &data).unwrap();
        prop_assert_eq!(container.size(), data.len() as u64);
        prop_assert_eq!(container.physical_size(), padded_size(data.len() as u64, MIN_PADDED_SIZE));
        prop_assert_eq!(read_all(&container).unwrap(), data);
    }
}
