use std::io::Write as _;
use std::os::fd::{AsRawFd, FromRawFd};
use std::time::Duration;

use riptide::{io, spawn, time};

mod common;

#[test]
fn op_futures_are_send() {
    // Spawnable futures require the payloads, vectored ones included, to
    // cross threads; the bound is also only nameable if `Payload` is
    // visible outside the crate.
    fn assert_send<T: Send>() {}
    assert_send::<io::Op<io::Read>>();
    assert_send::<io::Op<io::Readv>>();
    assert_send::<io::Op<io::Writev>>();
}

#[test]
fn nop_round_trips() {
    let rt = common::runtime(1);
    rt.block_on(async {
        io::nop().await.unwrap();
    });
}

#[test]
fn file_write_then_read_back() {
    let rt = common::runtime(2);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.txt");

    rt.block_on(async move {
        let fd = io::open(&path, libc::O_CREAT | libc::O_RDWR, 0o644)
            .unwrap()
            .await
            .unwrap();
        let raw = fd.as_raw_fd();

        let payload = b"riptide".to_vec();
        let (n, _) = io::write_at(raw, payload, 0).await.unwrap();
        assert_eq!(n, 7);
        io::fsync(raw).await.unwrap();

        let (n, buf) = io::read_at(raw, Vec::with_capacity(64), 0).await.unwrap();
        assert_eq!(n, 7);
        assert_eq!(&buf, b"riptide");

        io::close(fd).await.unwrap();

        let meta = io::statx(&path).unwrap().await.unwrap();
        assert_eq!(meta.stx_size, 7);
    });
}

#[test]
fn vectored_write_and_read() {
    let rt = common::runtime(2);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vectored.txt");

    rt.block_on(async move {
        let fd = io::open(&path, libc::O_CREAT | libc::O_WRONLY, 0o644)
            .unwrap()
            .await
            .unwrap();
        let bufs = vec![b"hello ".to_vec(), b"world".to_vec()];
        let (n, _) = io::writev(fd.as_raw_fd(), bufs).await.unwrap();
        assert_eq!(n, 11);
        io::close(fd).await.unwrap();

        let fd = io::open(&path, libc::O_RDONLY, 0).unwrap().await.unwrap();
        let chunks = vec![Vec::with_capacity(6), Vec::with_capacity(16)];
        let (n, chunks) = io::readv(fd.as_raw_fd(), chunks).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(&chunks[0], b"hello ");
        assert_eq!(&chunks[1], b"world");
        io::close(fd).await.unwrap();
    });
}

#[test]
fn read_from_missing_file_fails() {
    let rt = common::runtime(1);
    rt.block_on(async {
        let err = io::open("/definitely/not/a/real/path", libc::O_RDONLY, 0)
            .unwrap()
            .await
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    });
}

#[test]
fn op_deadline_times_out_a_stuck_read() {
    let rt = common::runtime(1);
    rt.block_on(async {
        // A pipe with no writer never completes a read.
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = fds;

        let err = io::read(read_fd, Vec::with_capacity(8))
            .deadline(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    });
}

#[test]
fn timeout_combinator_cancels_a_stuck_read() {
    let rt = common::runtime(1);
    rt.block_on(async {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = fds;

        let result = time::timeout(
            Duration::from_millis(20),
            io::read(read_fd, Vec::with_capacity(8)),
        )
        .await;
        assert!(result.is_err());

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    });
}

#[test]
fn completed_read_beats_its_deadline() {
    let rt = common::runtime(1);
    rt.block_on(async {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = fds;

        let writer = spawn(async move {
            time::sleep(Duration::from_millis(5)).await;
            let mut file = unsafe { std::fs::File::from_raw_fd(write_fd) };
            file.write_all(b"ok").unwrap();
        });

        let (n, buf) = io::read(read_fd, Vec::with_capacity(8))
            .deadline(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf, b"ok");

        writer.await.unwrap();
        unsafe { libc::close(read_fd) };
    });
}

#[test]
fn many_concurrent_nops() {
    let rt = common::runtime(4);
    rt.block_on(async {
        let handles: Vec<_> = (0..512)
            .map(|_| spawn(async { io::nop().await }))
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    });
}
