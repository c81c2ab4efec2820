use proptest::prelude::*;
use tapegraph::{Layout, RenderContext, TapeBuffer, TapeError};

fn stereo(frames: usize) -> RenderContext {
    RenderContext::new(48_000, frames).with_channels(2)
}

#[test]
fn dynamic_tape_reads_past_the_end_as_silence() {
    let mut tape = TapeBuffer::new(&stereo(4));
    tape.record_at(&[1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0], 0).unwrap();
    assert_eq!(tape.size(), 4);
    assert_eq!(tape.record_position(), 4);

    let out = tape.playback_at(4, 1, Layout::ChannelMajor);
    assert_eq!(out, [2.0, 3.0, 4.0, 0.0, 20.0, 30.0, 40.0, 0.0]);

    let out = tape.playback_at(4, 1, Layout::Interleaved);
    assert_eq!(out, [2.0, 20.0, 3.0, 30.0, 4.0, 40.0, 0.0, 0.0]);
}

#[test]
fn fixed_tape_slides_forward_over_the_edge() {
    let mut tape = TapeBuffer::with_capacity(&stereo(4), 8).unwrap();
    assert_eq!(tape.window(), 0..8);

    let block = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
    tape.record_at(&block, 6).unwrap();
    assert_eq!(tape.window(), 2..10);
    assert_eq!(tape.record_position(), 10);
    assert_eq!(tape.size(), 8);

    assert_eq!(tape.playback_at(4, 6, Layout::ChannelMajor), block);
    assert_eq!(tape.playback_at(4, 0, Layout::ChannelMajor), [0.0; 8]);
}

#[test]
fn dynamic_tape_grows_with_gaps() {
    let mut tape = TapeBuffer::new(&stereo(2));
    tape.record_at(&[1.0, 1.0, 2.0, 2.0], 6).unwrap();
    assert_eq!(tape.size(), 8);
    assert_eq!(tape.sample(0, 3), 0.0);
    assert_eq!(tape.sample(1, 7), 2.0);

    // earlier writes never move the record position back
    tape.record_at(&[3.0, 3.0, 4.0, 4.0], 0).unwrap();
    assert_eq!(tape.record_position(), 8);
    tape.record(&[5.0, 5.0, 6.0, 6.0]).unwrap();
    assert_eq!(tape.size(), 10);
    assert_eq!(tape.channel(0).unwrap()[8..], [5.0, 5.0]);
}

#[test]
fn seconds_map_to_sample_offsets() {
    let ctx = RenderContext::new(100, 4).with_channels(1);
    let mut tape = TapeBuffer::new(&ctx);
    tape.record_at_seconds(&[1.0, 2.0, 3.0, 4.0], 0.5).unwrap();
    assert_eq!(tape.record_position(), 54);
    assert!((tape.size_in_seconds() - 0.54).abs() < 1e-6);
    assert_eq!(tape.playback_at_seconds(2, 0.5, Layout::ChannelMajor), [1.0, 2.0]);

    let fixed = TapeBuffer::with_capacity_seconds(&ctx, 1.0).unwrap();
    assert_eq!(fixed.capacity(), Some(100));
}

#[test]
fn playback_follows_the_playback_position() {
    let ctx = RenderContext::new(48_000, 2).with_channels(1);
    let mut tape = TapeBuffer::new(&ctx);
    tape.record(&[1.0, 2.0]).unwrap();
    tape.record(&[3.0, 4.0]).unwrap();

    tape.set_playback_position(1);
    assert_eq!(tape.playback(Layout::ChannelMajor), [2.0, 3.0]);
}

#[test]
fn bad_shapes_are_rejected() {
    let ctx = stereo(4);
    let mut tape = TapeBuffer::new(&ctx);
    assert!(matches!(
        tape.record(&[0.0; 4]),
        Err(TapeError::BlockLength { expected: 8, actual: 4 })
    ));
    assert_eq!(tape.size(), 0);

    assert!(matches!(
        TapeBuffer::with_capacity(&ctx, 3),
        Err(TapeError::CapacityTooSmall { capacity: 3, frames_per_block: 4 })
    ));
    assert!(matches!(
        TapeBuffer::from_channels(4, 48_000, vec![vec![0.0; 3], vec![0.0; 5]]),
        Err(TapeError::ChannelMismatch)
    ));
    assert!(matches!(
        TapeBuffer::from_channels(4, 48_000, Vec::new()),
        Err(TapeError::ZeroChannels)
    ));
}

#[test]
fn preloaded_tape_appends_after_its_data() {
    let mut tape = TapeBuffer::from_channels(2, 48_000, vec![vec![1.0, 2.0, 3.0]]).unwrap();
    assert_eq!(tape.record_position(), 3);
    tape.record(&[4.0, 5.0]).unwrap();
    assert_eq!(tape.channel(0).unwrap(), [1.0, 2.0, 3.0, 4.0, 5.0]);
}

#[test]
fn clear_rewinds_positions() {
    let mut tape = TapeBuffer::with_capacity(&stereo(4), 8).unwrap();
    tape.record_at(&[1.0; 8], 10).unwrap();
    tape.set_playback_position(3);
    tape.clear();

    assert_eq!(tape.record_position(), 0);
    assert_eq!(tape.playback_position(), 0);
    assert_eq!(tape.window(), 0..8);
    assert_eq!(tape.playback_at(8, 0, Layout::ChannelMajor), [0.0; 16]);
}

proptest! {
    /// Sequential blocks on a fixed tape always leave the last `capacity`
    /// samples readable at their absolute positions.
    #[test]
    fn fixed_tape_keeps_the_trailing_window(blocks in 1usize..40, blocks_kept in 1usize..6) {
        let frames = 4;
        let ctx = RenderContext::new(48_000, frames).with_channels(1);
        let capacity = frames * blocks_kept;
        let mut tape = TapeBuffer::with_capacity(&ctx, capacity).unwrap();

        for b in 0..blocks {
            let block: Vec<f32> = (0..frames).map(|i| (b * frames + i) as f32).collect();
            tape.record(&block).unwrap();
        }

        let end = blocks * frames;
        let start = end.saturating_sub(capacity);
        prop_assert_eq!(tape.record_position(), end);
        prop_assert_eq!(tape.window(), start..start + capacity);
        for index in start..end {
            prop_assert_eq!(tape.sample(0, index), index as f32);
        }
        if start > 0 {
            prop_assert_eq!(tape.sample(0, start - 1), 0.0);
        }
    }

    /// A write before the window drags the window back and keeps what
    /// still fits.
    #[test]
    fn backward_writes_retract_the_window(back in 1usize..12) {
        let ctx = RenderContext::new(48_000, 4).with_channels(1);
        let mut tape = TapeBuffer::with_capacity(&ctx, 8).unwrap();
        tape.record_at(&[1.0; 4], 12).unwrap();
        tape.record_at(&[2.0; 4], 16).unwrap();

        let offset = 12 - back;
        tape.record_at(&[3.0; 4], offset).unwrap();
        prop_assert_eq!(tape.window(), offset..offset + 8);
        prop_assert_eq!(tape.record_position(), offset + 8);
        for i in offset..offset + 4 {
            prop_assert_eq!(tape.sample(0, i), 3.0);
        }
    }
}
