//! Decryption key cache.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;
use url::Url;

use crate::downloader::{ResourceFetcher, ResourceKind};
use crate::error::{HlsError, HlsResult};
use crate::parser::{KeyMethod, SegmentKey};
use crate::settings::{HlsSettings, KeyProcessorCallback};

/// Fetches decryption keys once per URI and decrypts segment payloads with them.
///
/// The cache is append-only: once a key is visible it never changes, so readers
/// only take the read lock for the lookup.
pub struct SegmentKeyStore {
    fetcher: Arc<dyn ResourceFetcher>,
    cache: RwLock<HashMap<Url, [u8; 16]>>,
    key_processor: Option<Arc<Box<KeyProcessorCallback>>>,
    key_query_params: Option<HashMap<String, String>>,
}

impl SegmentKeyStore {
    pub fn new(fetcher: Arc<dyn ResourceFetcher>) -> Self {
        Self {
            fetcher,
            cache: RwLock::new(HashMap::new()),
            key_processor: None,
            key_query_params: None,
        }
    }

    pub fn from_settings(fetcher: Arc<dyn ResourceFetcher>, settings: &HlsSettings) -> Self {
        Self {
            key_processor: settings.key_processor_cb.clone(),
            key_query_params: settings.key_query_params.clone(),
            ..Self::new(fetcher)
        }
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }

    /// Returns the key for `key_uri`, fetching it on first use.
    pub async fn resolve(&self, key_uri: &Url) -> HlsResult<[u8; 16]> {
        let cached = self.cache.read().get(key_uri).copied();
        if let Some(key) = cached {
            return Ok(key);
        }

        let fetch_url = self.finalize_key_url(key_uri);
        let raw = self
            .fetcher
            .fetch(&fetch_url, ResourceKind::Key, None)
            .await
            .map_err(|e| HlsError::key_fetch_failed(key_uri.as_str(), e))?;

        let processed = match &self.key_processor {
            Some(cb) => cb(raw),
            None => raw,
        };
        let key: [u8; 16] = processed.as_ref().try_into().map_err(|_| {
            HlsError::DecryptionFailed(format!(
                "key from {} has {} bytes, expected 16",
                key_uri,
                processed.len()
            ))
        })?;

        debug!(url = %key_uri, "fetched decryption key");
        // Two concurrent resolvers of the same URI get the same bytes; first insert wins.
        Ok(*self.cache.write().entry(key_uri.clone()).or_insert(key))
    }

    /// Decrypts `payload` with the key referenced by `key`. Passes the payload
    /// through unchanged when there is no key.
    pub async fn decrypt(
        &self,
        payload: Bytes,
        key: Option<&SegmentKey>,
        sequence: u64,
    ) -> HlsResult<Bytes> {
        let Some(key) = key else {
            return Ok(payload);
        };
        if key.method != KeyMethod::Aes128 {
            return Err(HlsError::DecryptionFailed(format!(
                "unsupported key method {:?}",
                key.method
            )));
        }

        let key_bytes = self.resolve(&key.uri).await?;
        Self::decrypt_with(&payload, &key_bytes, key.iv, sequence)
    }

    #[cfg(feature = "aes-decrypt")]
    fn decrypt_with(
        payload: &[u8],
        key: &[u8; 16],
        iv: Option<[u8; 16]>,
        sequence: u64,
    ) -> HlsResult<Bytes> {
        let iv = iv.unwrap_or_else(|| crate::crypto::iv_from_sequence(sequence));
        crate::crypto::decrypt_aes128_cbc(payload, key, &iv)
    }

    #[cfg(not(feature = "aes-decrypt"))]
    fn decrypt_with(
        _payload: &[u8],
        _key: &[u8; 16],
        _iv: Option<[u8; 16]>,
        _sequence: u64,
    ) -> HlsResult<Bytes> {
        Err(HlsError::DecryptionFailed(
            "built without the `aes-decrypt` feature".to_string(),
        ))
    }

    fn finalize_key_url(&self, key_uri: &Url) -> Url {
        let mut url = key_uri.clone();
        if let Some(params) = &self.key_query_params {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }
        url
    }
}

impl std::fmt::Debug for SegmentKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentKeyStore")
            .field("cached_keys", &self.len())
            .field("key_query_params", &self.key_query_params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::parser::ByteRange;

    struct KeyServer {
        key: Bytes,
        calls: AtomicUsize,
        last_url: parking_lot::Mutex<Option<Url>>,
    }

    #[async_trait]
    impl ResourceFetcher for KeyServer {
        async fn fetch(
            &self,
            url: &Url,
            kind: ResourceKind,
            _range: Option<ByteRange>,
        ) -> HlsResult<Bytes> {
            assert_eq!(kind, ResourceKind::Key);
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_url.lock() = Some(url.clone());
            Ok(self.key.clone())
        }
    }

    fn server(key: &[u8]) -> Arc<KeyServer> {
        Arc::new(KeyServer {
            key: Bytes::copy_from_slice(key),
            calls: AtomicUsize::new(0),
            last_url: parking_lot::Mutex::new(None),
        })
    }

    fn key_url() -> Url {
        Url::parse("http://keys.test/k1").unwrap()
    }

    #[tokio::test]
    async fn key_is_fetched_once() {
        let srv = server(&[9u8; 16]);
        let store = SegmentKeyStore::new(srv.clone());

        assert_eq!(store.resolve(&key_url()).await.unwrap(), [9u8; 16]);
        assert_eq!(store.resolve(&key_url()).await.unwrap(), [9u8; 16]);
        assert_eq!(srv.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn query_params_and_processor_apply() {
        let srv = server(&[1u8; 16]);
        let mut params = HashMap::new();
        params.insert("session".to_string(), "s1".to_string());
        let invert: Box<KeyProcessorCallback> =
            Box::new(|b: Bytes| Bytes::from(b.iter().map(|x| x ^ 0xff).collect::<Vec<u8>>()));
        let settings = HlsSettings::default()
            .key_query_params(Some(params))
            .key_processor_cb(Some(Arc::new(invert)));
        let store = SegmentKeyStore::from_settings(srv.clone(), &settings);

        assert_eq!(store.resolve(&key_url()).await.unwrap(), [0xfe; 16]);
        let fetched = srv.last_url.lock().clone().unwrap();
        assert_eq!(fetched.as_str(), "http://keys.test/k1?session=s1");
    }

    #[tokio::test]
    async fn short_key_is_rejected() {
        let store = SegmentKeyStore::new(server(&[1u8; 8]));
        let err = store.resolve(&key_url()).await.unwrap_err();
        assert!(matches!(err, HlsError::DecryptionFailed(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn payload_without_key_passes_through() {
        let srv = server(&[1u8; 16]);
        let store = SegmentKeyStore::new(srv.clone());
        let out = store
            .decrypt(Bytes::from_static(b"clear"), None, 3)
            .await
            .unwrap();
        assert_eq!(&out[..], b"clear");
        assert_eq!(srv.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sample_aes_is_not_decryptable_here() {
        let store = SegmentKeyStore::new(server(&[1u8; 16]));
        let key = SegmentKey {
            method: KeyMethod::SampleAes,
            uri: key_url(),
            iv: None,
        };
        let err = store
            .decrypt(Bytes::from_static(&[0u8; 16]), Some(&key), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, HlsError::DecryptionFailed(_)));
    }
}
