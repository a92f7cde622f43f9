pub mod serial;

/// Client → server pull request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RequestFrame {
    /// Byte size of one frame at the requested quality level.
    pub resolution: u32,
    /// Index of the next frame the client still needs.
    pub last_received_frame: u32,
    /// Frames consumed per playback tick.
    pub consumption_rate: u32,
}

/// Server → client chunk notice.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DataFrame {
    pub frame_index: u32,
    pub chunk_index: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Message {
    Request(RequestFrame),
    Data(DataFrame),
}

/// Number of chunks needed to carry a frame of `frame_size` bytes.
///
/// Both the server send loop and the client completion scan use this rule: chunk indices
/// `0..chunk_count(..)` make up a frame.
pub fn chunk_count(frame_size: u32, chunk_size: u32) -> u32 {
    debug_assert!(chunk_size > 0);
    frame_size.div_ceil(chunk_size)
}
