use std::fs::File;
use std::path::Path;

use lewton::inside_ogg::OggStreamReader;

use crate::tape::{TapeBuffer, TapeError};

impl TapeBuffer {
    /// Decode an Ogg Vorbis file into a dynamic tape, one channel per stream
    /// channel.
    ///
    /// The tape takes the file's sample rate; resampling is up to the host.
    pub fn load_vorbis(path: impl AsRef<Path>, frames_per_block: usize) -> Result<Self, TapeError> {
        let f = File::open(path.as_ref())?;
        let mut srr = OggStreamReader::new(f)?;

        let channels = srr.ident_hdr.audio_channels as usize;
        let sample_rate = srr.ident_hdr.audio_sample_rate;
        if channels == 0 {
            return Err(TapeError::ZeroChannels);
        }

        let mut data = vec![Vec::new(); channels];
        while let Some(packet) = srr.read_dec_packet_itl()? {
            for (idx, sample) in packet.iter().enumerate() {
                data[idx % channels].push(*sample as f32 / 32768.0);
            }
        }

        tracing::debug!(
            path = %path.as_ref().display(),
            channels,
            sample_rate,
            frames = data[0].len(),
            "decoded vorbis file into tape"
        );
        Self::from_channels(frames_per_block, sample_rate, data)
    }
}
