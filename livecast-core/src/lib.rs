//! `livecast-core`
//!
//! Shared plumbing for the livecast extension crates:
//!
//! - **`desc`**: session description model (medias, codec formats)
//! - **`unit`**: the envelope delivered from a stream to its readers
//! - **`stream`**: the per-path sample bus (readers, dispatch, RTP writes)
//! - **`path`**: traits mirroring the host's path registry and source hooks
//! - **`conf`**: per-path configuration records and validation
//! - **`mpegts`**: MPEG-TS mux/demux and the stream-to-TS bridge
//! - **`rtppack`**: RTP access-unit assembly and packetization helpers
//! - **`logging`**: tracing subscriber setup

pub mod conf;
pub mod desc;
pub mod logging;
pub mod mpegts;
pub mod path;
pub mod rtppack;
pub mod stream;
pub mod unit;
pub mod util;

pub use conf::{ConfigError, PathConfig};
pub use desc::{Format, Media, MediaType, Session};
pub use stream::{Reader, Stream, StreamParams};
pub use unit::Unit;
