use crate::buffer::BufferWindow;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

/// Write as much as possible of `to_write` to `io`, flushing once it is empty if
/// `to_write_flush_after` is set.
pub(crate) fn try_write<S: AsyncWrite + Unpin>(
    cx: &mut Context,
    io: &mut S,
    to_write: &mut BufferWindow,
    to_write_flush_after: &mut bool,
) -> Poll<io::Result<()>> {
    loop {
        if to_write.is_empty() {
            if *to_write_flush_after {
                trace!("try_write attempt flush");

                match Pin::new(&mut *io).poll_flush(cx) {
                    Poll::Pending => {
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(_)) => {
                        trace!("try_write flushed");
                        // flush done
                        *to_write_flush_after = false;
                    }
                    Poll::Ready(Err(e)) => {
                        trace!("try_write error: {:?}", e);
                        return Err(e).into();
                    }
                }
            }

            return Ok(()).into();
        }

        trace!("try_write left: {}", to_write.len());

        let poll = Pin::new(&mut *io).poll_write(cx, to_write.chunk());

        match poll {
            Poll::Pending => {
                // Pending is fine. It means the socket is full upstream, we can still
                // progress the downstream (i.e. drive_state()).
                trace!("try_write: Poll::Pending");
                return Poll::Pending;
            }

            Poll::Ready(Ok(0)) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "Transport accepted no bytes",
                ))
                .into();
            }

            // We managed to write some.
            Poll::Ready(Ok(amount)) => {
                trace!("try_write did write: {}", amount);
                to_write.consume(amount);
                *to_write_flush_after = true;
            }

            Poll::Ready(Err(e)) => {
                trace!("try_write error: {:?}", e);
                return Err(e).into();
            }
        }
    }
}
