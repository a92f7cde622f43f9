/*

abrstream streams a single video of fixed length from a server to any number of clients over UDP.
No media bytes are carried: each datagram is a fixed-size placeholder chunk, and the interesting
part is the bookkeeping around it.

# Messages

Two messages exist, each a short ASCII record zero-padded to the configured chunk size:

  REQUEST  client -> server  "res:<resolution> lrf:<next frame> fr:<frames per tick>"
  DATA     server -> client  "fn:<frame index> pn:<chunk index>"

A frame of R bytes is carried by ceil(R / chunk_size) chunks, indices 0.. in order. Both ends use
this one rule, otherwise a frame would never complete.

# Pulling

The server never sends unsolicited data. A REQUEST tells the server where the client is (the next
frame it lacks), how large frames should be, and how fast it plays. The server answers with every
chunk of the next `rate * lookahead` frames, and then forgets about it: the cursor only moves when
the client says so.

Because of this, loss needs no special handling. A client re-requests on every tick for as long as
frames remain, and each request resends the whole window from the first missing frame. Chunks
already received are deduplicated by the client.

A session holds at most one pending send. A newer request replaces it.

# Reassembly

The client keeps a bit set of received chunks per frame, along with the resolution it last
requested that frame at. Frames are promoted to the playback buffer strictly in order; a complete
frame beyond a gap waits for the gap to fill.

Since the level may change between requests, the number of chunks a frame needs is taken from the
resolution recorded for that frame, not the current level.

# Playback

Each tick, the client plays `rate` frames if it has them and otherwise counts a rebuffer:

  buffered >= rate:  consume, reset the rebuffer streak, step up one level if the remaining buffer
                     still covers a tick
  buffered <  rate:  streak += 1, step down one level once the streak reaches the threshold

A request goes out on every tick before any level change, so the change is carried by the next
tick's request. Once every frame has been received and the buffer can no longer cover a tick, the
remainder is drained and playback finishes.

*/

pub mod client;
pub mod config;
mod error;
pub mod frame;
pub mod ladder;
pub mod player;
pub mod reassembly;
pub mod server;
pub mod session;
pub mod sim;
mod socket;
pub mod timer_queue;

pub use config::{ClientConfig, LinkConfig, PlaybackConfig, ServerConfig, Settings, StreamConfig};
pub use error::{Error, Result};

pub type Client = client::Client;
pub type Server = server::Server;
