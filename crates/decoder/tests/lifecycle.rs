//! Creation, teardown and misuse handling of `NvpDecoder`.

mod support;

use std::sync::Arc;

use nvp_common::{
    CodecMode, DecoderConfig, InputBuffer, NvpError, OutputBuffer, PipeCodec, PixelFormat,
};
use nvp_decoder::{NvpDecoder, ParserCreateInfo, Reorganizer};

use support::{Rig, FRAME_UNIT};

fn decode_one(decoder: &mut NvpDecoder) {
    let mut output = vec![0u8; 64 * 32 * 3];
    decoder
        .decode(InputBuffer::Host(FRAME_UNIT), OutputBuffer::Host(&mut output), 64, 32)
        .unwrap();
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

#[test]
fn creation_is_lazy() {
    let rig = Rig::new(64, 32);
    let decoder = rig.decoder();

    assert!(!decoder.is_initialized());
    assert_eq!(rig.api.counters().parsers_created, 0);
    assert_eq!(rig.api.counters().decoders_created, 0);
    assert_eq!(rig.runtime.counters().events_created, 1);
    assert_eq!(rig.runtime.counters().allocs, 0);
    assert_eq!(decoder.staging_capacity(), 0);
}

#[test]
fn invalid_config_is_rejected() {
    let rig = Rig::new(64, 32);
    let config = DecoderConfig {
        num_decode_surfaces: 0,
        ..Rig::config()
    };

    let err = rig.decoder_with(config).unwrap_err();
    assert!(matches!(err, NvpError::Configuration(_)), "got {err:?}");
    assert_eq!(rig.runtime.counters().events_created, 0);
}

#[test]
fn event_failure_skips_conversion_stage() {
    let rig = Rig::new(64, 32);
    rig.runtime.failures.lock().create_event = true;
    let mut factory_called = false;

    let result = NvpDecoder::create(
        rig.api.clone(),
        rig.runtime.clone(),
        Rig::config(),
        || {
            factory_called = true;
            Err(NvpError::Unavailable("unreachable".into()))
        },
    );

    assert!(matches!(result, Err(NvpError::Synchronization(_))));
    assert!(!factory_called);
}

#[test]
fn conversion_stage_failure_releases_event() {
    let rig = Rig::new(64, 32);

    let result = NvpDecoder::create(
        rig.api.clone(),
        rig.runtime.clone(),
        Rig::config(),
        || -> nvp_common::NvpResult<Box<dyn Reorganizer>> {
            Err(NvpError::Unavailable("NVRTC compile failed".into()))
        },
    );

    assert!(matches!(result, Err(NvpError::Unavailable(_))));
    let counters = rig.runtime.counters();
    assert_eq!(counters.events_created, 1);
    assert_eq!(counters.events_destroyed, 1);
}

#[test]
fn parser_follows_json_config() {
    let rig = Rig::new(64, 32);
    let config = DecoderConfig::from_json(
        r#"{ "num_decode_surfaces": 4, "max_display_delay": 1, "error_threshold": 10,
             "panic_on_misuse": false }"#,
    )
    .unwrap();
    let mut decoder = rig.decoder_with(config).unwrap();

    decode_one(&mut decoder);

    assert_eq!(
        rig.api.parser_infos(),
        vec![ParserCreateInfo {
            codec: nvp_common::VideoCodec::H264,
            max_decode_surfaces: 4,
            error_threshold: 10,
            max_display_delay: 1,
        }]
    );
    assert_eq!(rig.api.decoder_infos()[0].num_decode_surfaces, 4);
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[test]
fn teardown_releases_everything_in_order() {
    let rig = Rig::new(64, 32);
    let mut decoder = rig.decoder();
    decode_one(&mut decoder);
    rig.journal.clear();

    drop(decoder);

    assert_eq!(
        rig.journal.entries(),
        vec!["destroy_parser", "destroy_decoder", "free", "reorg_drop", "destroy_event"]
    );
    assert_eq!(rig.runtime.live_blocks(), 0);
}

#[test]
fn teardown_before_first_decode() {
    let rig = Rig::new(64, 32);
    let decoder = rig.decoder();
    rig.journal.clear();

    drop(decoder);

    assert_eq!(rig.journal.entries(), vec!["reorg_drop", "destroy_event"]);
}

#[test]
fn teardown_failures_are_tolerated() {
    let rig = Rig::new(64, 32);
    let mut decoder = rig.decoder();
    decode_one(&mut decoder);
    {
        let mut failures = rig.api.failures.lock();
        failures.destroy_parser = true;
        failures.destroy_decoder = true;
    }
    rig.runtime.failures.lock().destroy_event = true;

    drop(decoder);

    assert_eq!(rig.api.counters().parsers_destroyed, 1);
    assert_eq!(rig.api.counters().decoders_destroyed, 1);
    assert_eq!(rig.runtime.counters().frees, 1);
    assert_eq!(rig.runtime.counters().events_destroyed, 1);
}

#[test]
fn decoder_is_released_after_failed_decode() {
    let rig = Rig::new(64, 32);
    let mut decoder = rig.decoder();
    rig.api.failures.lock().decode_picture = true;
    let mut output = vec![0u8; 64 * 32 * 3];
    assert!(decoder
        .decode(InputBuffer::Host(FRAME_UNIT), OutputBuffer::Host(&mut output), 64, 32)
        .is_err());

    drop(decoder);

    let counters = rig.api.counters();
    assert_eq!(counters.decoders_created, counters.decoders_destroyed);
    assert_eq!(counters.parsers_created, counters.parsers_destroyed);
    assert_eq!(rig.runtime.live_blocks(), 0);
}

// ---------------------------------------------------------------------------
// Codec surface
// ---------------------------------------------------------------------------

#[test]
fn encode_operations_are_rejected() {
    let rig = Rig::new(64, 32);
    let mut decoder = rig.decoder();
    decode_one(&mut decoder);
    let before = decoder.stats().clone();
    let frame = vec![0u8; 64 * 32 * 3];
    let mut packet = vec![0u8; 1024];

    assert_eq!(decoder.mode(), CodecMode::Decoder);
    let err = decoder
        .encode(InputBuffer::Host(&frame), &mut packet, 64, 32, PixelFormat::Rgb)
        .unwrap_err();
    assert!(matches!(err, NvpError::Configuration(_)), "got {err:?}");
    let err = decoder.set_bitrate(4_000_000).unwrap_err();
    assert!(matches!(err, NvpError::Configuration(_)), "got {err:?}");

    assert_eq!(decoder.stats(), &before);
    assert!(packet.iter().all(|&b| b == 0));

    // Still usable.
    decode_one(&mut decoder);
}

#[test]
#[should_panic(expected = "set_bitrate")]
fn misuse_panics_when_configured() {
    let rig = Rig::new(64, 32);
    let config = DecoderConfig {
        panic_on_misuse: true,
        ..Rig::config()
    };
    let mut decoder = rig.decoder_with(config).unwrap();
    let _ = decoder.set_bitrate(1);
}

#[test]
fn decodes_through_codec_trait_object() {
    let rig = Rig::new(64, 32);
    let mut codec: Box<dyn PipeCodec> = Box::new(rig.decoder());
    let mut output = vec![0u8; 64 * 32 * 3];

    codec
        .decode(InputBuffer::Host(FRAME_UNIT), OutputBuffer::Host(&mut output), 64, 32)
        .unwrap();

    assert!(output.iter().all(|&b| b == support::FILL));
    drop(codec);
    assert_eq!(rig.runtime.live_blocks(), 0);
}

#[test]
fn decoders_share_collaborators_independently() {
    let rig = Rig::new(64, 32);
    let mut first = rig.decoder();
    let mut second = rig.decoder();

    decode_one(&mut first);
    decode_one(&mut second);
    drop(first);

    assert_eq!(rig.api.counters().parsers_created, 2);
    assert_eq!(rig.api.counters().parsers_destroyed, 1);
    assert_eq!(rig.runtime.live_blocks(), 1);
    assert_eq!(Arc::strong_count(&rig.api), 2);

    decode_one(&mut second);
    assert_eq!(second.stats().frames_materialized, 2);
}
