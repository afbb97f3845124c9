//! HTTP client for the tracker's announce endpoint.
//!
//! Grounded in the pack's own cratetorrent fork's tracker module (raw
//! 20-byte percent-encoding, bencoded response shape) and the original
//! reference implementation's query parameters
//! (`examples/original_source/tracker.py`).

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use serde::{de, Deserialize};
use serde_bencode::value::Value;

use crate::{
    conf::ANNOUNCE_PORT,
    error::{Error, Result},
    PeerId, Sha1Hash,
};

const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// The result of a successful announce.
#[derive(Debug)]
pub(crate) struct TrackerAnnounce {
    /// How long to wait before the next announce.
    pub interval: Duration,
    /// The peers the tracker returned.
    pub peers: Vec<SocketAddr>,
}

/// An HTTP client bound to a single torrent's announce URL.
pub(crate) struct Tracker {
    client: Client,
    announce_url: String,
    info_hash: Sha1Hash,
    peer_id: PeerId,
}

impl Tracker {
    pub fn new(announce_url: String, info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self {
            client: Client::new(),
            announce_url,
            info_hash,
            peer_id,
        }
    }

    /// Announces to the tracker and returns the peer list and announce
    /// interval.
    ///
    /// `first` sends `event=started`, per spec: true iff there has been no
    /// prior successful announce (not the buggy "truthy previous timestamp"
    /// behavior of the original reference implementation).
    pub async fn announce(
        &self,
        first: bool,
        uploaded: u64,
        downloaded: u64,
        left: u64,
    ) -> Result<TrackerAnnounce> {
        let url = self.build_url(first, uploaded, downloaded, left);
        log::info!("Announcing to tracker at {}", self.announce_url);

        let bytes = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::TrackerUnreachable(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::TrackerUnreachable(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| Error::TrackerUnreachable(e.to_string()))?;

        reject_dictionary_model_peers(&bytes)?;
        let response: Response = serde_bencode::from_bytes(&bytes)?;

        if let Some(reason) = response.failure_reason {
            return Err(Error::TrackerRefused(reason));
        }

        Ok(TrackerAnnounce {
            interval: Duration::from_secs(response.interval),
            peers: response.peers,
        })
    }

    fn build_url(&self, first: bool, uploaded: u64, downloaded: u64, left: u64) -> String {
        let mut url = self.announce_url.clone();
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str("info_hash=");
        url.push_str(
            &percent_encoding::percent_encode(&self.info_hash, URL_ENCODE_RESERVED)
                .to_string(),
        );
        url.push_str("&peer_id=");
        url.push_str(
            &percent_encoding::percent_encode(&self.peer_id, URL_ENCODE_RESERVED)
                .to_string(),
        );
        url.push_str(&format!("&port={}", ANNOUNCE_PORT));
        url.push_str(&format!("&uploaded={}", uploaded));
        url.push_str(&format!("&downloaded={}", downloaded));
        url.push_str(&format!("&left={}", left));
        url.push_str("&compact=1");
        if first {
            url.push_str("&event=started");
        }
        url
    }
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: u64,
    #[serde(default, deserialize_with = "deserialize_compact_peers")]
    peers: Vec<SocketAddr>,
}

/// Returns `Error::UnsupportedPeerFormat` if the response's top-level
/// dictionary has a `peers` key holding a list (the dictionary model: a
/// list of `{ip, port}` maps) rather than a byte string (the compact
/// model). Run before the strongly-typed parse below, since by the time
/// `deserialize_compact_peers` sees a list it can only fail with a
/// generic serde error, not this crate's own error type.
fn reject_dictionary_model_peers(bytes: &[u8]) -> Result<()> {
    let value: Value = serde_bencode::from_bytes(bytes)?;
    if let Value::Dict(dict) = value {
        if let Some(Value::List(_)) = dict.get(&b"peers".to_vec()) {
            return Err(Error::UnsupportedPeerFormat);
        }
    }
    Ok(())
}

/// Parses a compact peer list: a byte string whose length is a multiple of
/// 6 (4-byte big-endian IPv4 followed by 2-byte big-endian port).
///
/// Assumes `reject_dictionary_model_peers` already ran; the `visit_seq`
/// arm below is an inner defense only, reached if it didn't.
fn deserialize_compact_peers<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct Visitor;

    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
            fmt.write_str("a compact (binary) peer list")
        }

        fn visit_bytes<E>(self, b: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if b.len() % 6 != 0 {
                return Err(de::Error::custom(
                    "compact peer list length must be a multiple of 6",
                ));
            }
            Ok(b.chunks_exact(6)
                .map(|chunk| {
                    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    SocketAddr::new(IpAddr::V4(ip), port)
                })
                .collect())
        }

        fn visit_seq<A>(self, _seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            Err(de::Error::custom(
                "dictionary-model peer lists are not supported",
            ))
        }
    }

    deserializer.deserialize_any(Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_announce_url_with_started_event_on_first_call() {
        let tracker = Tracker::new(
            "http://tracker.test/announce".into(),
            [1; 20],
            [2; 20],
        );
        let url = tracker.build_url(true, 0, 0, 100);
        assert!(url.contains("event=started"));
        assert!(url.contains("compact=1"));
        assert!(url.contains(&format!("port={}", ANNOUNCE_PORT)));
    }

    #[test]
    fn omits_started_event_on_subsequent_calls() {
        let tracker = Tracker::new(
            "http://tracker.test/announce".into(),
            [1; 20],
            [2; 20],
        );
        let url = tracker.build_url(false, 10, 20, 80);
        assert!(!url.contains("event=started"));
        assert!(url.contains("left=80"));
    }

    #[test]
    fn parses_compact_peer_list() {
        let raw = b"d8:intervali1800e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x7f\x00\x00\x02\x1a\xe2e";
        let response: Response = serde_bencode::from_bytes(raw).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].port(), 0x1ae1);
    }

    #[test]
    fn rejects_dictionary_model_peer_list() {
        let raw = b"d8:intervali1800e5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let result: std::result::Result<Response, _> = serde_bencode::from_bytes(raw);
        assert!(result.is_err());
    }

    #[test]
    fn reject_dictionary_model_peers_reports_unsupported_format() {
        let raw = b"d8:intervali1800e5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let err = reject_dictionary_model_peers(raw).unwrap_err();
        assert!(matches!(err, Error::UnsupportedPeerFormat));
    }

    #[test]
    fn reject_dictionary_model_peers_accepts_compact_list() {
        let raw = b"d8:intervali1800e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x7f\x00\x00\x02\x1a\xe2e";
        assert!(reject_dictionary_model_peers(raw).is_ok());
    }

    #[test]
    fn failure_reason_is_surfaced() {
        let raw = b"d14:failure reason13:bad info_hashe";
        let response: Response = serde_bencode::from_bytes(raw).unwrap();
        assert_eq!(response.failure_reason.as_deref(), Some("bad info_hash"));
    }

    #[tokio::test]
    async fn announce_against_mock_server_returns_peers() {
        let body = b"d8:intervali900e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x7f\x00\x00\x02\x1a\xe2e";
        let _m = mockito::mock("GET", mockito::Matcher::Regex("^/announce.*".into()))
            .with_status(200)
            .with_body(&body[..])
            .create();

        let tracker = Tracker::new(format!("{}/announce", mockito::server_url()), [3; 20], [4; 20]);
        let announce = tracker.announce(true, 0, 0, 100).await.unwrap();
        assert_eq!(announce.interval, Duration::from_secs(900));
        assert_eq!(announce.peers.len(), 2);
    }

    #[tokio::test]
    async fn announce_surfaces_failure_reason() {
        let body = b"d14:failure reason13:bad info_hashe";
        let _m = mockito::mock("GET", mockito::Matcher::Regex("^/announce.*".into()))
            .with_status(200)
            .with_body(&body[..])
            .create();

        let tracker = Tracker::new(format!("{}/announce", mockito::server_url()), [3; 20], [4; 20]);
        let err = tracker.announce(true, 0, 0, 100).await.unwrap_err();
        assert!(matches!(err, Error::TrackerRefused(_)));
    }

    #[tokio::test]
    async fn announce_rejects_dictionary_model_peers() {
        let body = b"d8:intervali1800e5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let _m = mockito::mock("GET", mockito::Matcher::Regex("^/announce.*".into()))
            .with_status(200)
            .with_body(&body[..])
            .create();

        let tracker = Tracker::new(format!("{}/announce", mockito::server_url()), [3; 20], [4; 20]);
        let err = tracker.announce(true, 0, 0, 100).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedPeerFormat));
    }
}
