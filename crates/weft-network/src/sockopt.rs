use std::os::fd::AsRawFd;

/// Set kernel SO_SNDBUF and SO_RCVBUF on any socket.
pub(crate) fn set_socket_buf_size<S: AsRawFd>(sock: &S, size: usize) {
    set_buf(sock, libc::SO_SNDBUF, size);
    set_buf(sock, libc::SO_RCVBUF, size);
}

pub(crate) fn set_buf<S: AsRawFd>(sock: &S, name: libc::c_int, size: usize) {
    let fd = sock.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            name,
            &size as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

pub(crate) fn get_buf<S: AsRawFd>(sock: &S, name: libc::c_int) -> std::io::Result<usize> {
    let fd = sock.as_raw_fd();
    let mut size: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            name,
            &mut size as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(size as usize)
}
