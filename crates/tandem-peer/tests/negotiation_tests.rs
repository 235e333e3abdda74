//! Negotiation Tests (tandem-peer)
//!
//! Offer/answer through the public connection API:
//! - Connection creation and STUN server validation
//! - Transceiver rules
//! - Local/remote description preconditions and idempotence
//! - Gathering notifications and candidates in the local description
//! - Offerer and answerer flows reaching a connected state

use std::sync::Arc;
use std::time::Duration;

use tandem_peer::{
    Error, Factory, IceConnectionState, IceGatheringState, IceTransport, MediaKind, SdpType,
    SessionDescription, SignalingState, TransceiverDirection,
};
use tandem_test_utils::{
    init_tracing, remote_addr, test_factory, wait_until, RecordingObserver, RemotePeer,
    ScriptedTransport, DEFAULT_TIMEOUT,
};

fn setup() -> (Arc<ScriptedTransport>, Factory, Arc<RecordingObserver>) {
    init_tracing();
    let transport = ScriptedTransport::new();
    let factory = test_factory(transport.clone());
    (transport, factory, RecordingObserver::new())
}

// ============================================================================
// Creation Tests
// ============================================================================

#[test]
fn test_factory_requires_transport() {
    let err = Factory::builder().build().err().expect("build must fail");
    assert!(matches!(err, Error::PreconditionViolated(_)));
}

#[test]
fn test_factory_uses_configured_interfaces() {
    let (_, factory, _) = setup();
    assert_eq!(factory.interfaces(), &["127.0.0.1".parse::<std::net::IpAddr>().unwrap()]);
    assert!(factory.codecs().len() >= 4);
    factory.destroy();
}

#[test]
fn test_create_connection_initial_state() {
    let (_, factory, observer) = setup();
    let pc = factory
        .create_peer_connection("stun:stun.l.google.com:19302", observer)
        .unwrap();

    assert_eq!(pc.ice_connection_state(), IceConnectionState::New);
    assert_eq!(pc.ice_gathering_state(), IceGatheringState::New);
    assert_eq!(pc.signaling_state(), SignalingState::Stable);
    assert!(pc.local_description().is_none());
    assert!(pc.remote_description().is_none());
    assert!(pc.transceivers().is_empty());
    assert_eq!(pc.stun_server().host, "stun.l.google.com");
    assert_eq!(pc.stun_server().port, 19302);
}

#[test]
fn test_create_connection_rejects_empty_stun_server() {
    let (_, factory, observer) = setup();
    let err = factory.create_peer_connection("", observer).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_connections_have_distinct_ids() {
    let (_, factory, observer) = setup();
    let a = factory
        .create_peer_connection("stun.test", observer.clone())
        .unwrap();
    let b = factory.create_peer_connection("stun.test", observer).unwrap();
    assert_ne!(a.id(), b.id());
}

// ============================================================================
// Transceiver Tests
// ============================================================================

#[test]
fn test_duplicate_transceiver_kind_rejected() {
    let (_, factory, observer) = setup();
    let pc = factory.create_peer_connection("stun.test", observer).unwrap();

    pc.add_video_transceiver().unwrap();
    let err = pc.add_video_transceiver().unwrap_err();
    assert!(matches!(err, Error::PreconditionViolated(_)));

    pc.add_audio_transceiver().unwrap();
    let err = pc
        .add_transceiver(MediaKind::Audio, TransceiverDirection::SendRecv)
        .unwrap_err();
    assert!(matches!(err, Error::PreconditionViolated(_)));
    assert_eq!(pc.transceivers().len(), 2);
}

#[test]
fn test_transceivers_get_sequential_mids() {
    let (_, factory, observer) = setup();
    let pc = factory.create_peer_connection("stun.test", observer).unwrap();

    let video = pc.add_video_transceiver().unwrap();
    let audio = pc.add_audio_transceiver().unwrap();
    assert_eq!(video.mid, "0");
    assert_eq!(audio.mid, "1");
    assert_eq!(video.direction, TransceiverDirection::RecvOnly);
}

#[test]
fn test_offer_requires_transceiver() {
    let (_, factory, observer) = setup();
    let pc = factory.create_peer_connection("stun.test", observer).unwrap();
    assert!(matches!(
        pc.create_offer(),
        Err(Error::PreconditionViolated(_))
    ));
}

#[test]
fn test_offer_describes_transceivers() {
    let (_, factory, observer) = setup();
    let pc = factory.create_peer_connection("stun.test", observer).unwrap();
    pc.add_video_transceiver().unwrap();
    pc.add_audio_transceiver().unwrap();

    let offer = pc.create_offer().unwrap();
    assert_eq!(offer.sdp_type(), SdpType::Offer);
    assert!(offer.sdp().starts_with("v=0\r\n"));
    assert!(offer.sdp().contains("m=video "));
    assert!(offer.sdp().contains("m=audio "));
    assert!(offer.sdp().contains("a=recvonly"));
    assert!(offer.sdp().contains("a=rtpmap:96 VP8/90000"));
    assert!(offer.sdp().contains("a=rtpmap:111 opus/48000/2"));

    // Creating an offer applies nothing
    assert!(pc.local_description().is_none());
    assert_eq!(pc.ice_gathering_state(), IceGatheringState::New);
}

// ============================================================================
// Description Precondition Tests
// ============================================================================

#[test]
fn test_local_description_unset_then_exact_text() {
    let (_, factory, observer) = setup();
    let pc = factory.create_peer_connection("stun.test", observer).unwrap();
    pc.add_video_transceiver().unwrap();

    assert!(pc.local_description().is_none());
    let offer = pc.create_offer().unwrap();
    pc.set_local_description(offer.clone()).unwrap();

    let local = pc.local_description().unwrap();
    assert_eq!(local.sdp(), offer.sdp());
    assert_eq!(local.sdp_type(), SdpType::Offer);
    assert_eq!(pc.signaling_state(), SignalingState::HaveLocalOffer);
}

#[test]
fn test_local_answer_before_offer_rejected() {
    let (_, factory, observer) = setup();
    let pc = factory.create_peer_connection("stun.test", observer).unwrap();
    pc.add_video_transceiver().unwrap();

    let offer = pc.create_offer().unwrap();
    let as_answer =
        SessionDescription::new(SdpType::Answer, offer.sdp().replace("actpass", "active"));

    let err = pc.set_local_description(as_answer).unwrap_err();
    assert!(matches!(err, Error::PreconditionViolated(_)));
    assert!(pc.local_description().is_none());
    assert_eq!(pc.ice_gathering_state(), IceGatheringState::New);
}

#[test]
fn test_unknown_description_type_rejected() {
    for text in ["pranswer", "rollback", ""] {
        let err = text.parse::<SdpType>().unwrap_err();
        assert!(matches!(err, Error::MalformedDescription(_)), "{:?}: {:?}", text, err);
    }
}

#[test]
fn test_malformed_remote_rejected_without_change() {
    let (_, factory, observer) = setup();
    let pc = factory.create_peer_connection("stun.test", observer).unwrap();
    pc.add_video_transceiver().unwrap();
    pc.set_local_description(pc.create_offer().unwrap()).unwrap();

    let err = pc
        .set_remote_description(SessionDescription::answer("v=0\r\nthis is not sdp\r\n"))
        .unwrap_err();
    assert!(matches!(err, Error::MalformedDescription(_)));
    assert!(pc.remote_description().is_none());
    assert_eq!(pc.ice_connection_state(), IceConnectionState::New);
}

#[test]
fn test_set_local_is_idempotent() {
    let (_, factory, observer) = setup();
    let pc = factory
        .create_peer_connection("stun.test", observer.clone())
        .unwrap();
    pc.add_video_transceiver().unwrap();
    let offer = pc.create_offer().unwrap();

    pc.set_local_description(offer.clone()).unwrap();
    pc.set_local_description(offer.clone()).unwrap();

    assert_eq!(pc.local_description().unwrap(), offer);
    assert!(wait_until(DEFAULT_TIMEOUT, || {
        pc.ice_gathering_state() == IceGatheringState::Complete
    }));
    pc.close();
    assert_eq!(
        observer.gathering_states(pc.id()),
        vec![IceGatheringState::Gathering, IceGatheringState::Complete]
    );
}

#[test]
fn test_second_offer_after_local_offer_rejected() {
    let (_, factory, observer) = setup();
    let pc = factory.create_peer_connection("stun.test", observer).unwrap();
    pc.add_video_transceiver().unwrap();
    pc.set_local_description(pc.create_offer().unwrap()).unwrap();
    assert!(matches!(
        pc.create_offer(),
        Err(Error::PreconditionViolated(_))
    ));
}

#[test]
fn test_remote_answer_without_offer_rejected() {
    let (_, factory, observer) = setup();
    let pc = factory.create_peer_connection("stun.test", observer).unwrap();
    let other = factory
        .create_peer_connection("stun.test", RecordingObserver::new())
        .unwrap();
    other.add_video_transceiver().unwrap();
    let answer = RemotePeer::at(&[remote_addr(40000)]).answer(&other.create_offer().unwrap());

    assert!(matches!(
        pc.set_remote_description(answer),
        Err(Error::PreconditionViolated(_))
    ));
}

// ============================================================================
// Gathering Tests
// ============================================================================

#[test]
fn test_gathering_complete_reported_exactly_once() {
    let (_, factory, observer) = setup();
    let pc = factory
        .create_peer_connection("stun:stun.invalid:3478", observer.clone())
        .unwrap();
    pc.add_video_transceiver().unwrap();
    pc.set_local_description(pc.create_offer().unwrap()).unwrap();

    assert!(wait_until(DEFAULT_TIMEOUT, || {
        observer
            .gathering_states(pc.id())
            .contains(&IceGatheringState::Complete)
    }));
    pc.close();

    let complete = observer
        .gathering_states(pc.id())
        .into_iter()
        .filter(|s| *s == IceGatheringState::Complete)
        .count();
    assert_eq!(complete, 1);
}

#[test]
fn test_gathering_starts_on_first_transceiver_after_local_description() {
    let (transport, factory, observer) = setup();
    let pc = factory
        .create_peer_connection("stun.test", observer.clone())
        .unwrap();

    let offer = {
        let scratch = factory
            .create_peer_connection("stun.test", RecordingObserver::new())
            .unwrap();
        scratch.add_video_transceiver().unwrap();
        scratch.create_offer().unwrap()
    };
    pc.set_local_description(offer).unwrap();
    assert_eq!(pc.ice_gathering_state(), IceGatheringState::New);
    assert_eq!(transport.bind_count(), 0);

    pc.add_video_transceiver().unwrap();
    assert!(wait_until(DEFAULT_TIMEOUT, || {
        pc.ice_gathering_state() == IceGatheringState::Complete
    }));
}

#[test]
fn test_current_local_description_lists_candidates() {
    let (transport, factory, observer) = setup();
    transport.set_reflexive("127.0.0.1".parse().unwrap(), "203.0.113.9".parse().unwrap());
    let pc = factory.create_peer_connection("stun.test", observer).unwrap();
    pc.add_video_transceiver().unwrap();
    assert!(pc.current_local_description().is_none());

    pc.set_local_description(pc.create_offer().unwrap()).unwrap();
    assert!(wait_until(DEFAULT_TIMEOUT, || {
        pc.ice_gathering_state() == IceGatheringState::Complete
    }));

    let current = pc.current_local_description().unwrap();
    assert_eq!(current.sdp_type(), SdpType::Offer);
    assert!(current.sdp().contains("typ host"));
    assert!(current.sdp().contains("203.0.113.9"));
    assert!(current.sdp().contains("typ srflx"));
    assert!(current.sdp().contains("a=end-of-candidates"));

    let parsed = current.parse().unwrap();
    assert_eq!(parsed.candidates.len(), pc.local_candidates().len());
    // The applied text itself is untouched
    assert!(!pc.local_description().unwrap().sdp().contains("typ srflx"));
}

// ============================================================================
// Connection Flow Tests
// ============================================================================

#[test]
fn test_offerer_flow_connects() {
    let (_, factory, observer) = setup();
    let pc = factory
        .create_peer_connection("stun.test", observer.clone())
        .unwrap();
    pc.add_video_transceiver().unwrap();
    pc.add_audio_transceiver().unwrap();

    let offer = pc.create_offer().unwrap();
    pc.set_local_description(offer.clone()).unwrap();
    let remote = RemotePeer::at(&[remote_addr(40000)]);
    pc.set_remote_description(remote.answer(&offer)).unwrap();
    assert_eq!(pc.signaling_state(), SignalingState::Stable);

    assert!(wait_until(DEFAULT_TIMEOUT, || {
        pc.ice_connection_state() == IceConnectionState::Completed
    }));
    let pair = pc.selected_candidate_pair().unwrap();
    assert_eq!(pair.remote.address, remote_addr(40000));

    assert!(wait_until(DEFAULT_TIMEOUT, || {
        observer.has_ice_state(pc.id(), IceConnectionState::Completed)
    }));
    assert_eq!(
        observer.ice_states(pc.id()),
        vec![
            IceConnectionState::Checking,
            IceConnectionState::Connected,
            IceConnectionState::Completed,
        ]
    );
}

#[test]
fn test_answerer_flow_connects() {
    let (_, factory, observer) = setup();
    let pc = factory
        .create_peer_connection("stun.test", observer.clone())
        .unwrap();
    let remote = RemotePeer::at(&[remote_addr(40000)]);

    pc.set_remote_description(remote.offer(&[MediaKind::Video, MediaKind::Audio]))
        .unwrap();
    assert_eq!(pc.signaling_state(), SignalingState::HaveRemoteOffer);
    let kinds: Vec<_> = pc.transceivers().iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![MediaKind::Video, MediaKind::Audio]);

    let answer = pc.create_answer().unwrap();
    assert_eq!(answer.sdp_type(), SdpType::Answer);
    assert!(answer.sdp().contains("a=recvonly"));
    assert!(answer.sdp().contains("a=setup:active"));
    pc.set_local_description(answer).unwrap();
    assert_eq!(pc.signaling_state(), SignalingState::Stable);

    assert!(wait_until(DEFAULT_TIMEOUT, || {
        pc.ice_connection_state() == IceConnectionState::Completed
    }));
}

#[test]
fn test_answer_requires_remote_offer() {
    let (_, factory, observer) = setup();
    let pc = factory.create_peer_connection("stun.test", observer).unwrap();
    pc.add_video_transceiver().unwrap();
    assert!(matches!(
        pc.create_answer(),
        Err(Error::PreconditionViolated(_))
    ));
}

#[test]
fn test_transceiver_after_negotiation_rejected() {
    let (_, factory, observer) = setup();
    let pc = factory.create_peer_connection("stun.test", observer).unwrap();
    pc.add_video_transceiver().unwrap();
    let offer = pc.create_offer().unwrap();
    pc.set_local_description(offer.clone()).unwrap();
    pc.set_remote_description(RemotePeer::at(&[remote_addr(40000)]).answer(&offer))
        .unwrap();

    assert!(matches!(
        pc.add_audio_transceiver(),
        Err(Error::PreconditionViolated(_))
    ));
}

#[test]
fn test_unreachable_peer_fails() {
    let (transport, factory, observer) = setup();
    transport.set_all_unreachable(true);
    let pc = factory
        .create_peer_connection("stun.test", observer.clone())
        .unwrap();
    pc.add_video_transceiver().unwrap();
    let offer = pc.create_offer().unwrap();
    pc.set_local_description(offer.clone()).unwrap();
    pc.set_remote_description(RemotePeer::at(&[remote_addr(40000)]).answer(&offer))
        .unwrap();

    assert!(wait_until(DEFAULT_TIMEOUT, || {
        observer.has_ice_state(pc.id(), IceConnectionState::Failed)
    }));
    assert_eq!(
        observer.ice_states(pc.id()),
        vec![IceConnectionState::Checking, IceConnectionState::Failed]
    );
    assert!(pc.selected_candidate_pair().is_none());
}

#[test]
fn test_remote_replacement_rejected_after_checking() {
    let (transport, factory, observer) = setup();
    transport.set_check_delay(Duration::from_millis(50));
    let pc = factory.create_peer_connection("stun.test", observer).unwrap();
    pc.add_video_transceiver().unwrap();
    let offer = pc.create_offer().unwrap();
    pc.set_local_description(offer.clone()).unwrap();
    let first = RemotePeer::at(&[remote_addr(40000)]).answer(&offer);
    pc.set_remote_description(first.clone()).unwrap();

    // Same text again is fine
    pc.set_remote_description(first.clone()).unwrap();

    let second = RemotePeer::at(&[remote_addr(40001)]).answer(&offer);
    assert!(matches!(
        pc.set_remote_description(second),
        Err(Error::PreconditionViolated(_))
    ));
    assert_eq!(pc.remote_description().unwrap(), first);
}

#[test]
fn test_factory_rejects_empty_codec_registry() {
    let transport: Arc<dyn IceTransport> = ScriptedTransport::new();
    let err = Factory::builder()
        .transport(transport)
        .codecs(tandem_peer::CodecRegistry::new(Vec::new()))
        .build()
        .err()
        .expect("build must fail");
    assert!(matches!(err, Error::InvalidArgument(_)));
}
