//! End-to-end scenarios exercising the full `select(2)`-driven dispatch
//! loop rather than individual module internals.

use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixDatagram;

use canopy::message::Message;
use canopy::{Mode, Runtime};

#[test]
fn ancillary_fd_passing_round_trips_through_a_message_channel() {
    let (a, b) = UnixDatagram::pair().unwrap();
    let fd_b = b.into_raw_fd();

    let passed = std::fs::File::open("/dev/null").unwrap();
    let mut msg = Message::new();
    msg.payload.push(b"take this fd").unwrap();
    msg.push_control(
        libc::SOL_SOCKET,
        libc::SCM_RIGHTS,
        &(passed.as_raw_fd() as RawFd).to_ne_bytes(),
    )
    .unwrap();
    msg.send(a.as_raw_fd()).unwrap();

    let rt = Runtime::new();
    let channel = rt
        .reopen(None, fd_b, Mode::Message, None, None, None)
        .unwrap();

    let mut nfds = 0;
    let mut rd: libc::fd_set = unsafe { std::mem::zeroed() };
    let mut wr: libc::fd_set = unsafe { std::mem::zeroed() };
    let mut ex: libc::fd_set = unsafe { std::mem::zeroed() };
    unsafe {
        libc::FD_ZERO(&mut rd);
        libc::FD_ZERO(&mut wr);
        libc::FD_ZERO(&mut ex);
    }
    rt.select_fds(&mut nfds, &mut rd, &mut wr, &mut ex);
    let mut timeout = libc::timeval {
        tv_sec: 1,
        tv_usec: 0,
    };
    unsafe {
        libc::select(nfds, &mut rd, &mut wr, &mut ex, &mut timeout);
    }
    rt.handle_fds(&rd, &wr, &ex);

    let received_id = rt.read_message(None, channel).expect("message queued");
    let received: Message = rt.get(received_id).expect("message payload present");
    assert_eq!(received.payload.as_slice(), b"take this fd");

    let records = received.control_records();
    assert_eq!(records.len(), 1);
    let (level, ty, data) = &records[0];
    assert_eq!(*level, libc::SOL_SOCKET);
    assert_eq!(*ty, libc::SCM_RIGHTS);
    assert_eq!(data.len(), std::mem::size_of::<RawFd>());
}

#[test]
fn first_channel_creation_leaves_sigpipe_ignored() {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (r, _w) = (fds[0], fds[1]);

    let rt = Runtime::new();
    rt.reopen(None, r, Mode::Stream, None, None, None).unwrap();

    let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigaction(libc::SIGPIPE, std::ptr::null(), &mut old);
    }
    assert_eq!(old.sa_sigaction, libc::SIG_IGN);
}

#[test]
fn select_loop_drives_a_stream_echo_end_to_end() {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (r, w) = (fds[0], fds[1]);

    let rt = Runtime::new();
    let received = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let received2 = received.clone();
    let reader: canopy::channel::ReaderFn = Box::new(move |rt, ch| {
        let block = rt.read(None, ch, 4096).unwrap();
        let data: Vec<u8> = rt.get(block).unwrap();
        received2.borrow_mut().extend(data);
    });
    let channel = rt
        .reopen(None, r, Mode::Stream, Some(reader), None, None)
        .unwrap();

    unsafe {
        libc::write(w, b"ping".as_ptr() as *const _, 4);
    }

    let mut nfds = 0;
    let mut rd: libc::fd_set = unsafe { std::mem::zeroed() };
    let mut wr: libc::fd_set = unsafe { std::mem::zeroed() };
    let mut ex: libc::fd_set = unsafe { std::mem::zeroed() };
    unsafe {
        libc::FD_ZERO(&mut rd);
        libc::FD_ZERO(&mut wr);
        libc::FD_ZERO(&mut ex);
    }
    rt.select_fds(&mut nfds, &mut rd, &mut wr, &mut ex);
    let mut timeout = libc::timeval {
        tv_sec: 1,
        tv_usec: 0,
    };
    unsafe {
        libc::select(nfds, &mut rd, &mut wr, &mut ex, &mut timeout);
    }
    rt.handle_fds(&rd, &wr, &ex);

    let data = received.borrow();
    assert_eq!(&data[..data.len() - 1], b"ping");

    let _ = channel;
    canopy::sys::close(w);
}
