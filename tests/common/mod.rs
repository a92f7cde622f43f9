use abrstream::{ClientConfig, PlaybackConfig, ServerConfig, StreamConfig};

/// A short stream with small chunks, cheap enough for real sockets.
pub fn small_stream(total_frames: u32) -> StreamConfig {
    StreamConfig {
        chunk_size: 1000,
        total_frames,
        quality_ladder: vec![1000, 2000, 3000],
        lookahead_window_secs: 5,
    }
}

/// Playback at the default rate of 9 frames per tick, with ticks `tick_ms` apart.
pub fn fast_playback(tick_ms: u64) -> PlaybackConfig {
    PlaybackConfig {
        initial_delay_ms: tick_ms,
        tick_interval_ms: tick_ms,
        ..Default::default()
    }
}

pub fn client_config(stream: &StreamConfig, playback: PlaybackConfig) -> ClientConfig {
    ClientConfig {
        stream: stream.clone(),
        playback,
    }
}

pub fn server_config(stream: &StreamConfig) -> ServerConfig {
    ServerConfig {
        stream: stream.clone(),
        ..Default::default()
    }
}

/// Installs a test-friendly subscriber once. Output shows with `--nocapture` and `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
