//! The `Accept` trait: how a server obtains inbound connections.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::common::Io;

/// Asynchronously yields inbound byte streams.
///
/// Returning `None` means the provider has stopped and the accept loop
/// should end.
pub trait Accept {
    /// The connection type produced.
    type Conn: Io;

    /// Poll for the next connection.
    fn poll_accept(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<Self::Conn>>>;
}

/// An adaptor for a polling closure, mostly useful in tests.
pub fn poll_fn<F, IO>(f: F) -> impl Accept<Conn = IO> + Unpin
where
    F: FnMut(&mut Context<'_>) -> Poll<Option<io::Result<IO>>> + Unpin,
    IO: Io,
{
    struct PollFn<F>(F);

    impl<F, IO> Accept for PollFn<F>
    where
        F: FnMut(&mut Context<'_>) -> Poll<Option<io::Result<IO>>> + Unpin,
        IO: Io,
    {
        type Conn = IO;

        fn poll_accept(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Option<io::Result<Self::Conn>>> {
            (self.get_mut().0)(cx)
        }
    }

    PollFn(f)
}
