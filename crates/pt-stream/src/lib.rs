// pt-stream: the byte-stream core of the tunnel.
//
// Builds the long-lived duplex out of one POST and one GET, frames it with
// heartbeats so relay intermediaries don't sever idle bodies, and provides
// the backoff policy and the symmetric copy primitive the supervisor loops
// are built from.

pub mod backoff;
pub mod duplex;
pub mod heartbeat;
pub mod splice;

pub use backoff::ExponentialBackoff;
pub use duplex::PipingDuplex;
pub use heartbeat::HeartbeatDuplex;
pub use splice::{combine_results, splice};

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream the tunnel can carry.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

/// Owned, type-erased tunnel stream.
pub type BoxedStream = Box<dyn TunnelStream>;
