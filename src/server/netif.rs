//! Interface address lookup

use std::net::Ipv4Addr;

/// Primary IPv4 address of interface `name`, if it is up and addressed
pub fn interface_ipv4(name: &str) -> Option<Ipv4Addr> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ || bytes.contains(&0) {
        return None;
    }

    // SAFETY: ifreq is plain old data, all-zero is a valid value
    let mut request: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in request.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    // SAFETY: plain socket(2) call, the descriptor is closed below
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return None;
    }

    // SAFETY: request is a valid ifreq with a NUL-terminated name
    let result = unsafe { libc::ioctl(fd, libc::SIOCGIFADDR, &mut request) };
    // SAFETY: fd came from socket(2) above
    unsafe { libc::close(fd) };
    if result < 0 {
        return None;
    }

    // SAFETY: SIOCGIFADDR on an AF_INET socket fills ifru_addr with a sockaddr_in
    let address = unsafe {
        let addr = &request.ifr_ifru.ifru_addr as *const libc::sockaddr as *const libc::sockaddr_in;
        (*addr).sin_addr.s_addr
    };
    Some(Ipv4Addr::from(u32::from_be(address)))
}
