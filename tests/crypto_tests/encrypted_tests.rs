//! Tests for EncryptedContainer and EncryptedBuffer
//!
//! These tests verify:
//! - Correct key recovers the plaintext; size excludes the header
//! - Wrong key or tampered header fails with a security error
//! - Bad magic and truncation fail with a format error
//! - Random access decryption at arbitrary offsets
//! - Shadows and container/buffer conversion keep the key context

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use proptest::prelude::*;
use tempfile::TempDir;
use vessel::container::{read_all, write_all, FileBuffer, FileContainer, FileOptions, MemoryBuffer, MemoryContainer};
use vessel::crypto::{HkdfSha256, KeyDerivation, MasterSecret, HEADER_LEN, HEADER_MAGIC};
use vessel::encrypted::{EncryptedBuffer, EncryptedContainer};
use vessel::{Container, ContainerKind, ErrorKind, InputStream, RandomBuffer};

// =============================================================================
// Helper Functions
// =============================================================================

fn kdf() -> Arc<dyn KeyDerivation> {
    Arc::new(HkdfSha256)
}

fn secret_a() -> MasterSecret {
    MasterSecret::from_bytes([0x11; 32])
}

fn secret_b() -> MasterSecret {
    MasterSecret::from_bytes([0x22; 32])
}

fn setup_encrypted_file(data: &[u8]) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("secret.bin");
    let container = EncryptedContainer::new(
        Box::new(FileContainer::new(&path, FileOptions::default())),
        &secret_a(),
        kdf(),
    )
    .unwrap();
    write_all(&container, data).unwrap();
    (temp_dir, path)
}

fn reopen(path: &PathBuf, secret: &MasterSecret) -> EncryptedContainer {
    EncryptedContainer::new(Box::new(FileContainer::new(path, FileOptions::default())), secret, kdf()).unwrap()
}

fn flip_byte(path: &PathBuf, index: usize) {
    let mut raw = fs::read(path).unwrap();
    raw[index] ^= 0x01;
    fs::write(path, raw).unwrap();
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_round_trip_in_memory() {
    let container = EncryptedContainer::new(Box::new(MemoryContainer::new()), &secret_a(), kdf()).unwrap();
    write_all(&container, b"attack at dawn").unwrap();

    assert_eq!(container.size(), 14);
    assert_eq!(container.physical_size(), 14 + HEADER_LEN as u64);
    assert_eq!(read_all(&container).unwrap(), b"attack at dawn");
    assert_eq!(container.kind(), ContainerKind::Encrypted);
}

#[test]
fn test_never_written_has_no_input_stream() {
    let container = EncryptedContainer::new(Box::new(MemoryContainer::new()), &secret_a(), kdf()).unwrap();
    assert!(container.input_stream().unwrap().is_none());
    assert_eq!(container.size(), 0);
}

#[test]
fn test_never_written_has_no_buffer_view() {
    let container = EncryptedContainer::new(Box::new(MemoryContainer::new()), &secret_a(), kdf()).unwrap();
    assert_eq!(container.to_random_buffer().unwrap_err().kind(), ErrorKind::Resource);
}

#[test]
fn test_dropped_stream_keeps_previous_ciphertext() {
    let (_temp, path) = setup_encrypted_file(b"GOOD COMPLETE RECORD");
    let before = fs::read(&path).unwrap();
    let container = reopen(&path, &secret_a());
    {
        let mut output = container.output_stream().unwrap();
        output.write_all(b"PART").unwrap();
    }

    assert_eq!(fs::read(&path).unwrap(), before);
    assert_eq!(read_all(&container).unwrap(), b"GOOD COMPLETE RECORD");
}

#[test]
fn test_ciphertext_on_disk() {
    let plaintext = b"this must not appear on disk in the clear";
    let (_temp, path) = setup_encrypted_file(plaintext);

    let raw = fs::read(&path).unwrap();
    assert_eq!(raw.len(), HEADER_LEN + plaintext.len());
    assert_eq!(&raw[HEADER_LEN - 8..HEADER_LEN], &HEADER_MAGIC.to_be_bytes());
    assert_ne!(&raw[HEADER_LEN..], &plaintext[..]);

    let container = reopen(&path, &secret_a());
    assert_eq!(read_all(&container).unwrap(), plaintext);
}

#[test]
fn test_each_write_uses_fresh_header() {
    let (_temp, path) = setup_encrypted_file(b"same plaintext");
    let first = fs::read(&path).unwrap();

    write_all(&reopen(&path, &secret_a()), b"same plaintext").unwrap();
    let second = fs::read(&path).unwrap();

    assert_eq!(first.len(), second.len());
    assert_ne!(&first[..12], &second[..12]);
    assert_ne!(&first[HEADER_LEN..], &second[HEADER_LEN..]);
}

#[test]
fn test_skip_reseeks_keystream() {
    let container = EncryptedContainer::new(Box::new(MemoryContainer::new()), &secret_a(), kdf()).unwrap();
    write_all(&container, b"0123456789abcdef").unwrap();

    let mut input = container.input_stream().unwrap().unwrap();
    assert_eq!(input.available(), 16);
    assert_eq!(input.skip(10).unwrap(), 10);
    let mut rest = String::new();
    input.read_to_string(&mut rest).unwrap();
    assert_eq!(rest, "abcdef");
}

// =============================================================================
// Failure Tests
// =============================================================================

#[test]
fn test_wrong_key_is_security_error() {
    let (_temp, path) = setup_encrypted_file(b"for key A only");

    let container = reopen(&path, &secret_b());
    let err = container.input_stream().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Security);
}

#[test]
fn test_flipped_header_bytes_are_security_errors() {
    // IV, wrapped key, MAC
    for index in [0, 12, 44, 75] {
        let (_temp, path) = setup_encrypted_file(b"tamper target");
        flip_byte(&path, index);

        let err = reopen(&path, &secret_a()).input_stream().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security, "byte {}", index);
    }
}

#[test]
fn test_flipped_version_or_magic_is_format_error() {
    for index in [HEADER_LEN - 12, HEADER_LEN - 1] {
        let (_temp, path) = setup_encrypted_file(b"framing");
        flip_byte(&path, index);

        let err = reopen(&path, &secret_a()).input_stream().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format, "byte {}", index);
    }
}

#[test]
fn test_truncated_header_is_format_error() {
    let (_temp, path) = setup_encrypted_file(b"short");
    let raw = fs::read(&path).unwrap();
    fs::write(&path, &raw[..HEADER_LEN / 2]).unwrap();

    let err = reopen(&path, &secret_a()).input_stream().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
}

#[test]
fn test_wrong_key_buffer_open_fails() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("buffer.bin");
    let inner = FileBuffer::create(&path, HEADER_LEN as u64 + 32, false).unwrap();
    let buffer = EncryptedBuffer::create(Box::new(inner), &secret_a(), kdf()).unwrap();
    buffer.pwrite(0, b"sealed").unwrap();
    buffer.close().unwrap();
    drop(buffer);

    let reopened = FileBuffer::open(&path, true, false).unwrap();
    let err = EncryptedBuffer::open(Box::new(reopened), &secret_b(), kdf()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Security);

    let reopened = FileBuffer::open(&path, true, false).unwrap();
    let buffer = EncryptedBuffer::open(Box::new(reopened), &secret_a(), kdf()).unwrap();
    let mut out = [0u8; 6];
    buffer.pread(0, &mut out).unwrap();
    assert_eq!(&out, b"sealed");
}

#[test]
fn test_buffer_open_without_header_is_format_error() {
    let plain = MemoryContainer::from_vec(vec![0u8; HEADER_LEN + 32]);
    let view = plain.to_random_buffer().unwrap();
    assert_eq!(EncryptedBuffer::open(view, &secret_a(), kdf()).unwrap_err().kind(), ErrorKind::Format);
}

// =============================================================================
// Random Access Tests
// =============================================================================

#[test]
fn test_to_random_buffer_decrypts_at_offset() {
    let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let container = EncryptedContainer::new(Box::new(MemoryContainer::new()), &secret_a(), kdf()).unwrap();
    write_all(&container, &data).unwrap();

    let buffer = container.to_random_buffer().unwrap();
    assert_eq!(buffer.size(), data.len() as u64);
    assert!(buffer.is_read_only());

    for offset in [0usize, 1, 63, 64, 65, 4095, 9_990] {
        let mut out = vec![0u8; 10];
        buffer.pread(offset as u64, &mut out).unwrap();
        assert_eq!(out, &data[offset..offset + 10], "offset {}", offset);
    }
}

#[test]
fn test_buffer_pwrite_then_container_read() {
    let inner = MemoryBuffer::new(HEADER_LEN as u64 + 256);
    let buffer = Box::new(EncryptedBuffer::create(Box::new(inner), &secret_a(), kdf()).unwrap());
    assert_eq!(buffer.size(), 256);

    buffer.pwrite(100, b"positional").unwrap();
    let mut out = [0u8; 10];
    buffer.pread(100, &mut out).unwrap();
    assert_eq!(&out, b"positional");

    let container = buffer.into_container().unwrap();
    let all = read_all(container.as_ref()).unwrap();
    assert_eq!(all.len(), 256);
    assert_eq!(&all[100..110], b"positional");
}

#[test]
fn test_buffer_rejects_too_small_inner() {
    let inner = MemoryBuffer::new(HEADER_LEN as u64 - 1);
    let err = EncryptedBuffer::create(Box::new(inner), &secret_a(), kdf()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
}

// =============================================================================
// Shadow Tests
// =============================================================================

#[test]
fn test_shadow_decrypts_and_is_read_only() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("shadowed.bin");
    let container = EncryptedContainer::new(
        Box::new(FileContainer::new(
            &path,
            FileOptions {
                delete_on_dispose: true,
                ..FileOptions::default()
            },
        )),
        &secret_a(),
        kdf(),
    )
    .unwrap();
    write_all(&container, b"shadow me").unwrap();

    let shadow = container.create_shadow().unwrap().unwrap();
    assert!(shadow.is_read_only());
    assert_eq!(shadow.kind(), ContainerKind::Encrypted);
    assert_eq!(read_all(shadow.as_ref()).unwrap(), b"shadow me");

    shadow.dispose().unwrap();
    assert!(path.exists());
    assert_eq!(read_all(&container).unwrap(), b"shadow me");
}

// =============================================================================
// Property Tests
// =============================================================================

proptest! {
    #[test]
    fn prop_encrypted_round_trip(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
        let container = EncryptedContainer::new(Box::new(MemoryContainer::new()), &secret_a(), kdf()).unwrap();
        write_all(&container, &data).unwrap();
        prop_assert_eq!(container.size(), data.len() as u64);
        prop_assert_eq!(read_all(&container).unwrap(), data);
    }
}
