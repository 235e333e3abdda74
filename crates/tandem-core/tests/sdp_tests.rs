//! Session Description Tests (tandem-core)
//!
//! Parsing descriptions as real servers send them, and building offers that
//! such servers accept.

use tandem_core::sdp::{self, with_candidates, DescriptionBuilder, MediaLine};
use tandem_core::{
    CandidateType, CodecRegistry, Error, IceCandidate, MediaKind, SdpType, SessionDescription,
    TransceiverDirection,
};

const SERVER_ANSWER: &str = "v=0\r\n\
o=- 4215775240449105457 1696846245 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
a=extmap-allow-mixed\r\n\
a=msid-semantic: WMS *\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtcp:9 IN IP4 0.0.0.0\r\n\
a=setup:passive\r\n\
a=mid:0\r\n\
a=ice-ufrag:KsZcXwAmrXXzygMy\r\n\
a=ice-pwd:HoZjTqtqKbhxDzBzPHntOpdBxgzhkDax\r\n\
a=rtcp-mux\r\n\
a=rtcp-rsize\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtcp-fb:96 nack\r\n\
a=rtcp-fb:96 nack pli\r\n\
a=extmap:1 http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time\r\n\
a=fingerprint:sha-256 8A:1F:3C:55:0B:7E:92:AA:10:2B:C3:44:D5:E6:F7:08:19:2A:3B:4C:5D:6E:7F:80:91:A2:B3:C4:D5:E6:F7:08\r\n\
a=sendonly\r\n\
a=candidate:3540156416 1 udp 2130706431 192.168.1.20 8189 typ host\r\n\
a=candidate:2385431201 1 tcp 1671430143 192.168.1.20 8189 typ host tcptype passive\r\n\
a=candidate:1122334455 1 udp 1694498815 203.0.113.4 8189 typ srflx raddr 192.168.1.20 rport 8189\r\n\
a=end-of-candidates\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtcp:9 IN IP4 0.0.0.0\r\n\
a=setup:passive\r\n\
a=mid:1\r\n\
a=ice-ufrag:KsZcXwAmrXXzygMy\r\n\
a=ice-pwd:HoZjTqtqKbhxDzBzPHntOpdBxgzhkDax\r\n\
a=rtcp-mux\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=sendonly\r\n\
a=candidate:3540156416 1 udp 2130706431 192.168.1.20 8189 typ host\r\n\
a=candidate:2385431201 1 tcp 1671430143 192.168.1.20 8189 typ host tcptype passive\r\n\
a=end-of-candidates\r\n";

// ============================================================================
// Parsing Tests
// ============================================================================

#[test]
fn test_parse_server_answer() {
    let parsed = sdp::parse(SERVER_ANSWER, SdpType::Answer).unwrap();

    assert_eq!(parsed.session_id, "4215775240449105457");
    assert_eq!(parsed.session_version, 1696846245);
    assert_eq!(parsed.ice_ufrag.as_deref(), Some("KsZcXwAmrXXzygMy"));
    assert_eq!(
        parsed.ice_pwd.as_deref(),
        Some("HoZjTqtqKbhxDzBzPHntOpdBxgzhkDax")
    );
    assert!(parsed.end_of_candidates);

    assert_eq!(parsed.media.len(), 2);
    let video = parsed.section(MediaKind::Video).unwrap();
    assert_eq!(video.mid.as_deref(), Some("0"));
    assert_eq!(video.direction, TransceiverDirection::SendOnly);
    assert_eq!(video.setup.as_deref(), Some("passive"));
    assert_eq!(video.codecs.len(), 1);
    assert_eq!(video.codecs[0].name, "VP8");

    let audio = parsed.section(MediaKind::Audio).unwrap();
    assert_eq!(audio.codecs[0].channels, Some(2));
    assert_eq!(
        audio.codecs[0].fmtp.as_deref(),
        Some("minptime=10;useinbandfec=1")
    );
}

#[test]
fn test_parse_skips_tcp_and_dedups_candidates() {
    let parsed = sdp::parse(SERVER_ANSWER, SdpType::Answer).unwrap();

    // One UDP host (listed in both sections) plus one srflx; TCP skipped
    assert_eq!(parsed.candidates.len(), 2);
    assert_eq!(parsed.candidates[0].kind, CandidateType::Host);
    assert_eq!(parsed.candidates[0].address, "192.168.1.20:8189".parse().unwrap());
    assert_eq!(parsed.candidates[1].kind, CandidateType::Srflx);
    assert_eq!(
        parsed.candidates[1].related,
        Some("192.168.1.20:8189".parse().unwrap())
    );
}

#[test]
fn test_parse_accepts_bare_newlines() {
    let text = SERVER_ANSWER.replace("\r\n", "\n");
    assert!(sdp::parse(&text, SdpType::Answer).is_ok());
}

#[test]
fn test_answer_with_actpass_is_malformed() {
    let text = SERVER_ANSWER.replace("a=setup:passive", "a=setup:actpass");
    let err = sdp::parse(&text, SdpType::Answer).unwrap_err();
    assert!(matches!(err, Error::MalformedDescription(_)));

    // The same text is a valid offer
    assert!(sdp::parse(&text, SdpType::Offer).is_ok());
}

#[test]
fn test_structural_errors() {
    let cases = [
        ("", "empty"),
        ("o=- 1 1 IN IP4 0.0.0.0\r\nv=0\r\n", "version not first"),
        ("v=0\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n", "no origin"),
        ("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n", "no media"),
        ("v=0\r\no=- 1 IN IP4\r\ns=-\r\nt=0 0\r\nm=video 9 X 96\r\n", "short origin"),
        ("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\nm=video\r\n", "short media"),
        (
            "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\nm=video 9 X 96\r\nnonsense\r\n",
            "bad line",
        ),
    ];
    for (text, label) in cases {
        let err = SessionDescription::offer(text).parse().unwrap_err();
        assert!(
            matches!(err, Error::MalformedDescription(_)),
            "{}: got {:?}",
            label,
            err
        );
    }
}

#[test]
fn test_bad_udp_candidate_is_malformed() {
    let text = SERVER_ANSWER.replace(
        "192.168.1.20 8189 typ host\r\n",
        "192.168.1.999 8189 typ host\r\n",
    );
    let err = sdp::parse(&text, SdpType::Answer).unwrap_err();
    assert!(matches!(err, Error::MalformedDescription(_)));

    let text = SERVER_ANSWER.replace("8189 typ srflx", "notaport typ srflx");
    let err = sdp::parse(&text, SdpType::Answer).unwrap_err();
    assert!(matches!(err, Error::MalformedDescription(_)));
}

#[test]
fn test_parse_skips_mdns_hostname_candidates() {
    let mdns = concat!(
        "a=candidate:1 1 udp 2122260223 ",
        "3f2a9c1e-57d4-4b8a-9c6e-0d1f2e3a4bab.local 54321 typ host generation 0\r\n"
    );
    let text = SERVER_ANSWER.replacen("a=candidate:", &format!("{}a=candidate:", mdns), 1);
    assert!(text.contains(".local 54321"));

    let parsed = sdp::parse(&text, SdpType::Answer).unwrap();
    assert_eq!(parsed.candidates.len(), 2);
    assert!(parsed.candidates.iter().all(|c| c.address.port() == 8189));
}

// ============================================================================
// Building Tests
// ============================================================================

fn recvonly_offer() -> String {
    let codecs = CodecRegistry::default();
    DescriptionBuilder::new(SdpType::Offer, 42, "abcd1234", "0123456789abcdef01234567")
        .media(MediaLine {
            kind: MediaKind::Video,
            mid: "0".into(),
            direction: TransceiverDirection::RecvOnly,
            codecs: codecs.for_kind(MediaKind::Video).cloned().collect(),
        })
        .media(MediaLine {
            kind: MediaKind::Audio,
            mid: "1".into(),
            direction: TransceiverDirection::RecvOnly,
            codecs: codecs.for_kind(MediaKind::Audio).cloned().collect(),
        })
        .build()
}

#[test]
fn test_built_offer_parses_back() {
    let text = recvonly_offer();
    assert!(text.contains("a=group:BUNDLE 0 1\r\n"));
    assert!(text.contains("m=video 9 UDP/TLS/RTP/SAVPF 96 98 102\r\n"));
    assert!(text.contains("a=setup:actpass\r\n"));

    let parsed = sdp::parse(&text, SdpType::Offer).unwrap();
    assert_eq!(parsed.session_id, "42");
    assert_eq!(parsed.ice_ufrag.as_deref(), Some("abcd1234"));
    assert_eq!(parsed.media.len(), 2);
    assert!(parsed
        .media
        .iter()
        .all(|m| m.direction == TransceiverDirection::RecvOnly));
    assert!(parsed.candidates.is_empty());
    assert!(!parsed.end_of_candidates);
}

#[test]
fn test_with_candidates_fills_every_section() {
    let host = IceCandidate::host("10.0.0.5:50000".parse().unwrap(), 65535);
    let srflx = IceCandidate::server_reflexive(
        "203.0.113.9:50000".parse().unwrap(),
        "10.0.0.5:50000".parse().unwrap(),
        65535,
    );
    let text = with_candidates(&recvonly_offer(), &[host.clone(), srflx.clone()], true);

    assert_eq!(text.matches(&host.to_sdp_line()).count(), 2);
    assert_eq!(text.matches("a=end-of-candidates").count(), 2);

    let parsed = sdp::parse(&text, SdpType::Offer).unwrap();
    assert_eq!(parsed.candidates, vec![host, srflx]);
    assert!(parsed.end_of_candidates);
}

#[test]
fn test_with_candidates_replaces_previous_candidates() {
    let first = IceCandidate::host("10.0.0.5:50000".parse().unwrap(), 65535);
    let second = IceCandidate::host("10.0.0.6:50002".parse().unwrap(), 65534);

    let once = with_candidates(&recvonly_offer(), &[first.clone()], false);
    let twice = with_candidates(&once, &[second.clone()], true);

    assert!(!twice.contains(&first.to_sdp_line()));
    let parsed = sdp::parse(&twice, SdpType::Offer).unwrap();
    assert_eq!(parsed.candidates, vec![second]);
}
