use std::net::TcpListener;

use anyhow::Context;

/// Ask the OS for a free ephemeral port. The listener is dropped right away,
/// so this is inherently racy; the dev server rebinding it immediately after
/// is the expected pattern.
pub fn find_free_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).context("allocate ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_nonzero_ports() {
        let a = find_free_port().unwrap();
        let b = find_free_port().unwrap();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
    }
}
