//! Integration tests for mutable roots and open-file handles.
//!
//! Everything runs against an in-memory store so commit failures can be
//! injected.

use std::sync::Arc;

use blobfs_cas::MemoryStore;
use blobfs_vfs::stats::{MUTABLE_FILE_COMMIT_FAILED, MUTABLE_FILE_OPEN_RO};
use blobfs_vfs::{BlobFs, EntryKind, FsOptions, VfsError};

const APPEND: i32 = libc::O_WRONLY | libc::O_APPEND;

fn setup() -> (Arc<MemoryStore>, BlobFs) {
    let store = Arc::new(MemoryStore::new());
    let fs = BlobFs::new(
        store.clone(),
        FsOptions {
            stats_enabled: true,
            ..FsOptions::default()
        },
    )
    .unwrap();
    (store, fs)
}

fn setup_with_file(path: &str) -> (Arc<MemoryStore>, BlobFs) {
    let (store, fs) = setup();
    fs.mkdir("roots/r").unwrap();
    let (fh, _) = fs.create(path, libc::O_WRONLY).unwrap();
    fs.release(fh).unwrap();
    (store, fs)
}

fn write_with(fs: &BlobFs, path: &str, flags: i32, data: &[u8]) {
    let fh = fs.open(path, flags).unwrap();
    assert_eq!(fs.write(fh, 0, data).unwrap() as usize, data.len());
    fs.release(fh).unwrap();
}

/// Read a whole file in small chunks through one handle.
fn read_all(fs: &BlobFs, path: &str) -> Vec<u8> {
    let fh = fs.open(path, libc::O_RDONLY).unwrap();
    let mut out = Vec::new();
    loop {
        let chunk = fs.read(fh, out.len() as u64, 4).unwrap();
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    fs.release(fh).unwrap();
    out
}

fn ro_reads(fs: &BlobFs) -> u64 {
    fs.stats().snapshot(MUTABLE_FILE_OPEN_RO).unwrap()
}

#[test]
fn test_new_file_is_empty_regular_file() {
    let (_, fs) = setup();
    fs.mkdir("roots/r").unwrap();
    let (fh, attr) = fs.create("roots/r/x", libc::O_WRONLY).unwrap();
    assert_eq!(attr.kind, EntryKind::File);
    assert_eq!(attr.size, 0);

    // Stat before any write, with the handle still open.
    let attr = fs.getattr("roots/r/x").unwrap();
    assert_eq!(attr.kind, EntryKind::File);
    assert_eq!(attr.size, 0);
    fs.release(fh).unwrap();
}

#[test]
fn test_appends_across_opens_concatenate() {
    let (_, fs) = setup_with_file("roots/r/x");
    for part in ["foo, ", "bar\n", "another line.\n"] {
        write_with(&fs, "roots/r/x", APPEND, part.as_bytes());
    }

    assert_eq!(fs.getattr("roots/r/x").unwrap().size, 24);

    let before = ro_reads(&fs);
    let content = read_all(&fs, "roots/r/x");
    assert_eq!(content, b"foo, bar\nanother line.\n");
    // Many chunked reads, one fast-path hit for the handle.
    assert_eq!(ro_reads(&fs), before + 1);
}

#[test]
fn test_open_without_read_does_not_count() {
    let (_, fs) = setup_with_file("roots/r/x");
    let before = ro_reads(&fs);
    let fh = fs.open("roots/r/x", libc::O_RDONLY).unwrap();
    fs.release(fh).unwrap();
    assert_eq!(ro_reads(&fs), before);
}

#[test]
fn test_read_after_write_is_served_from_overlay() {
    let (_, fs) = setup_with_file("roots/r/x");
    let before = ro_reads(&fs);
    let fh = fs.open("roots/r/x", libc::O_RDWR).unwrap();
    fs.write(fh, 0, b"hello").unwrap();
    assert_eq!(fs.read(fh, 0, 100).unwrap(), b"hello");
    fs.release(fh).unwrap();
    assert_eq!(ro_reads(&fs), before);
}

#[test]
fn test_write_past_end_zero_fills() {
    let (_, fs) = setup_with_file("roots/r/x");
    let fh = fs.open("roots/r/x", libc::O_WRONLY).unwrap();
    fs.write(fh, 5, b"x").unwrap();
    fs.release(fh).unwrap();
    assert_eq!(read_all(&fs, "roots/r/x"), b"\0\0\0\0\0x");
}

#[test]
fn test_overwrite_keeps_tail() {
    let (_, fs) = setup_with_file("roots/r/x");
    write_with(&fs, "roots/r/x", libc::O_WRONLY, b"abcdef");
    let fh = fs.open("roots/r/x", libc::O_WRONLY).unwrap();
    fs.write(fh, 1, b"XY").unwrap();
    fs.release(fh).unwrap();
    assert_eq!(read_all(&fs, "roots/r/x"), b"aXYdef");
}

#[test]
fn test_truncating_open_discards_content() {
    let (_, fs) = setup_with_file("roots/r/x");
    write_with(&fs, "roots/r/x", libc::O_WRONLY, b"old content");
    write_with(&fs, "roots/r/x", libc::O_WRONLY | libc::O_TRUNC, b"new");
    assert_eq!(read_all(&fs, "roots/r/x"), b"new");
}

#[test]
fn test_truncate_by_path_and_handle() {
    let (_, fs) = setup_with_file("roots/r/x");
    write_with(&fs, "roots/r/x", libc::O_WRONLY, b"0123456789");

    let attr = fs.truncate("roots/r/x", None, 4).unwrap();
    assert_eq!(attr.size, 4);
    assert_eq!(read_all(&fs, "roots/r/x"), b"0123");

    let fh = fs.open("roots/r/x", libc::O_RDWR).unwrap();
    assert_eq!(fs.truncate("roots/r/x", Some(fh), 6).unwrap().size, 6);
    fs.release(fh).unwrap();
    assert_eq!(read_all(&fs, "roots/r/x"), b"0123\0\0");
}

#[test]
fn test_last_release_wins() {
    let (_, fs) = setup_with_file("roots/r/x");
    let a = fs.open("roots/r/x", libc::O_RDWR).unwrap();
    let b = fs.open("roots/r/x", libc::O_RDWR).unwrap();
    fs.write(a, 0, b"from a, longer").unwrap();
    fs.write(b, 0, b"from b").unwrap();

    fs.release(a).unwrap();
    assert_eq!(read_all(&fs, "roots/r/x"), b"from a, longer");
    fs.release(b).unwrap();
    assert_eq!(read_all(&fs, "roots/r/x"), b"from b");
}

#[test]
fn test_flush_commits_without_releasing() {
    let (_, fs) = setup_with_file("roots/r/x");
    let fh = fs.open("roots/r/x", libc::O_RDWR).unwrap();
    fs.write(fh, 0, b"draft").unwrap();
    fs.flush(fh).unwrap();
    assert_eq!(fs.getattr("roots/r/x").unwrap().size, 5);

    fs.write(fh, 5, b" two").unwrap();
    assert_eq!(fs.read(fh, 0, 64).unwrap(), b"draft two");
    fs.release(fh).unwrap();
    assert_eq!(read_all(&fs, "roots/r/x"), b"draft two");
}

#[test]
fn test_failed_commit_keeps_overlay() {
    let (store, fs) = setup_with_file("roots/r/x");
    let digest_before = fs.root_digest("r").unwrap();

    let fh = fs.open("roots/r/x", libc::O_WRONLY).unwrap();
    fs.write(fh, 0, b"precious").unwrap();

    store.set_fail_puts(true);
    let err = fs.release(fh).unwrap_err();
    assert!(matches!(err, VfsError::CommitFailed { .. }));
    assert_eq!(err.errno(), libc::EIO);
    assert_eq!(fs.root_digest("r").unwrap(), digest_before);
    assert_eq!(fs.getattr("roots/r/x").unwrap().size, 0);
    assert_eq!(fs.open_handles(), 1);
    assert_eq!(fs.stats().snapshot(MUTABLE_FILE_COMMIT_FAILED), Some(1));

    // Still failing: the handle stays pending.
    assert_eq!(fs.retry_pending(), 1);

    store.set_fail_puts(false);
    assert_eq!(fs.retry_pending(), 0);
    assert_eq!(fs.open_handles(), 0);
    assert_eq!(read_all(&fs, "roots/r/x"), b"precious");
}

#[test]
fn test_abandon_drops_overlay() {
    let (store, fs) = setup_with_file("roots/r/x");
    let fh = fs.open("roots/r/x", libc::O_WRONLY).unwrap();
    fs.write(fh, 0, b"lost").unwrap();
    store.set_fail_puts(true);
    assert!(fs.release(fh).is_err());
    store.set_fail_puts(false);

    fs.abandon(fh).unwrap();
    assert_eq!(fs.open_handles(), 0);
    assert!(read_all(&fs, "roots/r/x").is_empty());
    assert!(matches!(fs.read(fh, 0, 1), Err(VfsError::BadHandle(_))));
}

#[test]
fn test_fast_path_read_error_surfaces() {
    let (store, fs) = setup_with_file("roots/r/x");
    write_with(&fs, "roots/r/x", libc::O_WRONLY, b"data");
    let fh = fs.open("roots/r/x", libc::O_RDONLY).unwrap();
    store.set_fail_gets(true);
    let err = fs.read(fh, 0, 4).unwrap_err();
    assert!(matches!(err, VfsError::StoreUnavailable(_)));
    assert_eq!(err.errno(), libc::EIO);
    store.set_fail_gets(false);
    fs.release(fh).unwrap();
}

#[test]
fn test_remove_hides_file() {
    let (_, fs) = setup_with_file("roots/r/x");
    write_with(&fs, "roots/r/x", libc::O_WRONLY, b"bye");
    fs.unlink("roots/r/x").unwrap();

    assert!(fs.getattr("roots/r/x").unwrap_err().is_not_found());
    assert!(fs.open("roots/r/x", libc::O_RDONLY).unwrap_err().is_not_found());
    assert!(fs.readdir("roots/r").unwrap().is_empty());
    assert_eq!(fs.unlink("roots/r/x").unwrap_err().errno(), libc::ENOENT);
}

#[test]
fn test_commit_after_remove_does_not_resurrect() {
    let (_, fs) = setup_with_file("roots/r/x");
    let fh = fs.open("roots/r/x", libc::O_WRONLY).unwrap();
    fs.write(fh, 0, b"orphan").unwrap();
    fs.unlink("roots/r/x").unwrap();

    fs.release(fh).unwrap();
    assert!(fs.getattr("roots/r/x").unwrap_err().is_not_found());
}

#[test]
fn test_nested_directories() {
    let (_, fs) = setup();
    fs.mkdir("roots/r").unwrap();
    fs.mkdir("roots/r/a").unwrap();
    fs.mkdir("roots/r/a/b").unwrap();
    let (fh, _) = fs.create("roots/r/a/b/f", libc::O_WRONLY).unwrap();
    fs.write(fh, 0, b"deep").unwrap();
    fs.release(fh).unwrap();

    assert_eq!(read_all(&fs, "roots/r/a/b/f"), b"deep");
    assert_eq!(fs.getattr("roots/r/a").unwrap().kind, EntryKind::Dir);
    assert_eq!(fs.rmdir("roots/r/a").unwrap_err().errno(), libc::ENOTEMPTY);
    assert_eq!(fs.mkdir("roots/r/a").unwrap_err().errno(), libc::EEXIST);

    fs.unlink("roots/r/a/b/f").unwrap();
    fs.rmdir("roots/r/a/b").unwrap();
    fs.rmdir("roots/r/a").unwrap();
    assert!(fs.readdir("roots/r").unwrap().is_empty());
}

#[test]
fn test_wrong_type_is_not_not_found() {
    let (_, fs) = setup_with_file("roots/r/x");
    let err = fs.getattr("roots/r/x/child").unwrap_err();
    assert!(err.is_wrong_type());
    assert_eq!(err.errno(), libc::ENOTDIR);

    assert_eq!(fs.unlink("roots/r").unwrap_err().errno(), libc::EISDIR);
    assert_eq!(fs.rmdir("roots/r/x").unwrap_err().errno(), libc::ENOTDIR);
    assert_eq!(
        fs.open("roots/r", libc::O_RDONLY).unwrap_err().errno(),
        libc::EISDIR
    );
}

#[test]
fn test_root_lifecycle() {
    let (_, fs) = setup();
    fs.mkdir("roots/a").unwrap();
    fs.mkdir("roots/b").unwrap();
    let names: Vec<_> = fs.readdir("roots").unwrap().into_iter().map(|l| l.name).collect();
    assert_eq!(names, vec!["a", "b"]);

    assert_eq!(fs.mkdir("roots/a").unwrap_err().errno(), libc::EEXIST);
    fs.rmdir("roots/a").unwrap();
    assert!(fs.getattr("roots/a").unwrap_err().is_not_found());
}

#[test]
fn test_mutations_outside_roots_are_refused() {
    let (_, fs) = setup();
    assert_eq!(fs.mkdir("recent/x").unwrap_err().errno(), libc::EROFS);
    assert_eq!(
        fs.create("tag/x", libc::O_WRONLY).unwrap_err().errno(),
        libc::EROFS
    );
    assert_eq!(
        fs.create("roots/file", libc::O_WRONLY).unwrap_err().errno(),
        libc::EROFS
    );
    assert_eq!(
        fs.open("WELCOME.txt", libc::O_WRONLY).unwrap_err().errno(),
        libc::EROFS
    );
    assert_eq!(fs.mkdir("nowhere/x").unwrap_err().errno(), libc::ENOENT);
}

#[test]
fn test_rename_within_root_moves_open_handles() {
    let (_, fs) = setup_with_file("roots/r/x");
    fs.mkdir("roots/r/sub").unwrap();
    let fh = fs.open("roots/r/x", libc::O_WRONLY).unwrap();
    fs.write(fh, 0, b"moved").unwrap();

    fs.rename("roots/r/x", "roots/r/sub/y").unwrap();
    assert!(fs.getattr("roots/r/x").unwrap_err().is_not_found());

    fs.release(fh).unwrap();
    assert_eq!(read_all(&fs, "roots/r/sub/y"), b"moved");
}

#[test]
fn test_rename_rules() {
    let (_, fs) = setup_with_file("roots/r/x");
    fs.mkdir("roots/other").unwrap();
    fs.mkdir("roots/r/d").unwrap();

    let err = fs.rename("roots/r/x", "roots/other/x").unwrap_err();
    assert!(matches!(err, VfsError::CrossRoot { .. }));
    assert_eq!(err.errno(), libc::EXDEV);

    assert_eq!(
        fs.rename("roots/r/x", "roots/r/d").unwrap_err().errno(),
        libc::EISDIR
    );
    assert_eq!(
        fs.rename("roots/r/d", "roots/r/d/inside").unwrap_err().errno(),
        libc::EINVAL
    );
    assert_eq!(
        fs.rename("roots/r/missing", "roots/r/y").unwrap_err().errno(),
        libc::ENOENT
    );

    fs.rename("roots/other", "roots/renamed").unwrap();
    assert!(fs.getattr("roots/renamed").is_ok());
    assert!(fs.getattr("roots/other").is_err());
}

#[test]
fn test_concurrent_writers_in_one_root() {
    let (_, fs) = setup();
    fs.mkdir("roots/r").unwrap();
    let fs = Arc::new(fs);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let fs = Arc::clone(&fs);
            std::thread::spawn(move || {
                let path = format!("roots/r/f{}", i);
                let (fh, _) = fs.create(&path, libc::O_WRONLY).unwrap();
                fs.write(fh, 0, path.as_bytes()).unwrap();
                fs.release(fh).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(fs.readdir("roots/r").unwrap().len(), 8);
    for i in 0..8 {
        let path = format!("roots/r/f{}", i);
        assert_eq!(read_all(&fs, &path), path.as_bytes());
    }
}

#[test]
fn test_write_beyond_size_limit_is_refused() {
    let (_, fs) = setup_with_file("roots/r/x");
    write_with(&fs, "roots/r/x", libc::O_WRONLY, b"keep");

    let fh = fs.open("roots/r/x", libc::O_RDWR).unwrap();
    let err = fs.write(fh, (i64::MAX - 1) as u64, b"ab").unwrap_err();
    assert!(matches!(err, VfsError::FileTooLarge(_)));
    assert_eq!(err.errno(), libc::EFBIG);
    let err = fs.write(fh, u64::MAX, b"a").unwrap_err();
    assert_eq!(err.errno(), libc::EFBIG);

    // The handle is untouched and still usable.
    assert_eq!(fs.read(fh, 0, 64).unwrap(), b"keep");
    fs.write(fh, 4, b"!").unwrap();
    fs.release(fh).unwrap();
    assert_eq!(read_all(&fs, "roots/r/x"), b"keep!");
}

#[test]
fn test_truncate_beyond_size_limit_is_refused() {
    let (_, fs) = setup_with_file("roots/r/x");
    write_with(&fs, "roots/r/x", libc::O_WRONLY, b"keep");

    let err = fs.truncate("roots/r/x", None, u64::MAX).unwrap_err();
    assert_eq!(err.errno(), libc::EFBIG);

    let fh = fs.open("roots/r/x", libc::O_RDWR).unwrap();
    let err = fs.truncate("roots/r/x", Some(fh), u64::MAX / 2).unwrap_err();
    assert_eq!(err.errno(), libc::EFBIG);
    fs.release(fh).unwrap();

    assert_eq!(read_all(&fs, "roots/r/x"), b"keep");
    assert_eq!(fs.open_handles(), 0);
}

#[test]
fn test_failed_persist_fails_the_mutation() {
    let temp = tempfile::tempdir().unwrap();
    let head = temp.path().join("roots.head");
    let store = Arc::new(MemoryStore::new());
    let mount = |store: &Arc<MemoryStore>| {
        BlobFs::new(
            store.clone(),
            FsOptions {
                roots_head: Some(head.clone()),
                ..FsOptions::default()
            },
        )
        .unwrap()
    };

    let fs = mount(&store);
    fs.mkdir("roots/r").unwrap();
    let (fh, _) = fs.create("roots/r/x", libc::O_WRONLY).unwrap();
    fs.write(fh, 0, b"v1").unwrap();
    fs.release(fh).unwrap();

    let fh = fs.open("roots/r/x", libc::O_WRONLY).unwrap();
    fs.write(fh, 0, b"v2").unwrap();

    // A directory where the head file belongs makes every persist fail.
    std::fs::remove_file(&head).unwrap();
    std::fs::create_dir(&head).unwrap();

    let err = fs.release(fh).unwrap_err();
    assert!(matches!(err, VfsError::CommitFailed { .. }));
    assert_eq!(fs.open_handles(), 1);
    assert_eq!(read_all(&fs, "roots/r/x"), b"v1");

    assert!(fs.create("roots/r/y", libc::O_WRONLY).is_err());
    assert!(fs.getattr("roots/r/y").unwrap_err().is_not_found());
    assert!(fs.mkdir("roots/r/d").is_err());
    assert!(fs.getattr("roots/r/d").unwrap_err().is_not_found());
    assert!(fs.unlink("roots/r/x").is_err());
    assert!(fs.rename("roots/r/x", "roots/r/z").is_err());
    assert_eq!(fs.readdir("roots/r").unwrap().len(), 1);

    std::fs::remove_dir(&head).unwrap();
    assert_eq!(fs.retry_pending(), 0);
    assert_eq!(fs.open_handles(), 0);
    drop(fs);

    let remounted = mount(&store);
    assert_eq!(read_all(&remounted, "roots/r/x"), b"v2");
}

/// Flush after every write while another thread renames the file back and
/// forth. The last flushed content must be where the file ends up.
fn commits_race_renames(file: &str, there: &str, back: &str) {
    let (_, fs) = setup_with_file(file);
    let fs = Arc::new(fs);
    let fh = fs.open(file, libc::O_RDWR).unwrap();

    let renamer = {
        let fs = Arc::clone(&fs);
        let (there, back) = (there.to_string(), back.to_string());
        std::thread::spawn(move || {
            for i in 0..200 {
                let (from, to) = if i % 2 == 0 { (&back, &there) } else { (&there, &back) };
                fs.rename(from, to).unwrap();
            }
        })
    };
    const WRITES: u32 = 400;
    for i in 0..WRITES {
        fs.write(fh, 0, &i.to_be_bytes()).unwrap();
        fs.flush(fh).unwrap();
    }
    renamer.join().unwrap();
    fs.release(fh).unwrap();

    assert_eq!(read_all(&fs, file), (WRITES - 1).to_be_bytes());
}

#[test]
fn test_commits_racing_file_renames_are_kept() {
    commits_race_renames("roots/r/a", "roots/r/b", "roots/r/a");
}

#[test]
fn test_commits_racing_root_renames_are_kept() {
    commits_race_renames("roots/r/a", "roots/s", "roots/r");
}

#[test]
fn test_read_after_flush_is_not_a_read_only_open() {
    let (_, fs) = setup_with_file("roots/r/x");
    let before = ro_reads(&fs);

    let fh = fs.open("roots/r/x", libc::O_RDWR).unwrap();
    fs.write(fh, 0, b"data").unwrap();
    fs.flush(fh).unwrap();
    assert_eq!(fs.read(fh, 0, 64).unwrap(), b"data");
    fs.release(fh).unwrap();

    assert_eq!(ro_reads(&fs), before);
}
