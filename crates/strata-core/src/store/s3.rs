use std::io::Read;
use std::time::Duration;

use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};

use crate::error::{Result, StrataError};
use crate::store::BlobStore;

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;
const RETRY_MAX_DELAY_MS: u64 = 10_000;

/// Object-store backend. Single-object PUT is atomic at the service level,
/// which satisfies the publish contract without a stage step.
pub struct S3Store {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    /// Prefix (root path) prepended to all keys.
    root: String,
}

impl S3Store {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key_id: &str,
        secret_access_key: &str,
        root: &str,
    ) -> Result<Self> {
        let base_url = endpoint
            .parse()
            .map_err(|e| StrataError::Config(format!("invalid S3 endpoint '{endpoint}': {e}")))?;

        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            bucket_name.to_string(),
            region.to_string(),
        )
        .map_err(|e| StrataError::Config(format!("invalid S3 bucket '{bucket_name}': {e}")))?;

        let credentials = Credentials::new(access_key_id, secret_access_key);

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Ok(Self {
            bucket,
            credentials,
            agent,
            root: root.trim_matches('/').to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    /// Retry a request on transient errors with exponential backoff + jitter.
    #[allow(clippy::result_large_err)]
    fn retry_call<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, ureq::Error>,
    ) -> std::result::Result<T, ureq::Error> {
        let mut delay_ms = RETRY_DELAY_MS;
        let mut last_err = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let jitter = rand::random::<u64>() % delay_ms.max(1);
                std::thread::sleep(Duration::from_millis(delay_ms + jitter));
                delay_ms = (delay_ms * 2).min(RETRY_MAX_DELAY_MS);
            }
            match f() {
                Ok(val) => return Ok(val),
                Err(e) if is_retryable(&e) && attempt < MAX_RETRIES => {
                    tracing::warn!(
                        "S3 {op_name}: transient error (attempt {}/{MAX_RETRIES}), retrying: {e}",
                        attempt + 1,
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.expect("retry loop recorded an error"))
    }
}

fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
    }
}

impl BlobStore for S3Store {
    fn put_raw(&self, key: &str, data: &[u8]) -> Result<()> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .put_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        self.retry_call(&format!("PUT {key}"), || {
            self.agent.put(url.as_str()).send_bytes(data).map(|_| ())
        })
        .map_err(|e| StrataError::Transport(format!("S3 PUT {key}: {e}")))
    }

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        match self.retry_call(&format!("GET {key}"), || {
            self.agent.get(url.as_str()).call()
        }) {
            Ok(resp) => {
                let mut buf = Vec::new();
                resp.into_reader()
                    .read_to_end(&mut buf)
                    .map_err(StrataError::Io)?;
                Ok(Some(buf))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(StrataError::Transport(format!("S3 GET {key}: {e}"))),
        }
    }

    fn exists_raw(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .head_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        match self.retry_call(&format!("HEAD {key}"), || {
            self.agent.head(url.as_str()).call()
        }) {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(StrataError::Transport(format!("S3 HEAD {key}: {e}"))),
        }
    }

    fn delete_raw(&self, key: &str) -> Result<()> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        self.retry_call(&format!("DELETE {key}"), || {
            self.agent.delete(url.as_str()).call().map(|_| ())
        })
        .map_err(|e| StrataError::Transport(format!("S3 DELETE {key}: {e}")))
    }

    fn list_raw(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let root_prefix_len = if self.root.is_empty() {
            0
        } else {
            self.root.len() + 1
        };

        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action.query_mut().insert("prefix", &full_prefix);
            if let Some(ref token) = continuation_token {
                action.query_mut().insert("continuation-token", token);
            }
            let url = action.sign(PRESIGN_DURATION);

            let resp = self
                .retry_call(&format!("LIST {prefix}"), || {
                    self.agent.get(url.as_str()).call()
                })
                .map_err(|e| StrataError::Transport(format!("S3 LIST {prefix}: {e}")))?;

            let mut body = Vec::new();
            resp.into_reader()
                .read_to_end(&mut body)
                .map_err(StrataError::Io)?;

            let body_str = std::str::from_utf8(&body).map_err(|e| {
                StrataError::Transport(format!("S3 LIST {prefix}: bad response: {e}"))
            })?;
            let parsed = ListObjectsV2::parse_response(body_str).map_err(|e| {
                StrataError::Transport(format!("S3 LIST {prefix}: bad response: {e}"))
            })?;

            for obj in &parsed.contents {
                let key = &obj.key;
                if key.ends_with('/') {
                    continue;
                }
                if root_prefix_len > 0 && key.len() > root_prefix_len {
                    keys.push(key[root_prefix_len..].to_string());
                } else {
                    keys.push(key.clone());
                }
            }

            match parsed.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store(root: &str) -> S3Store {
        S3Store::new(
            "bucket",
            "https://s3.example.com",
            "us-east-1",
            "key",
            "secret",
            root,
        )
        .unwrap()
    }

    #[test]
    fn full_key_joins_root_prefix() {
        let store = test_store("sets/home");
        assert_eq!(store.full_key("ab/cd"), "sets/home/ab/cd");
        assert_eq!(store.full_key("manifest"), "sets/home/manifest");
    }

    #[test]
    fn full_key_without_root_is_identity() {
        let store = test_store("");
        assert_eq!(store.full_key("ab/cd"), "ab/cd");
    }

    #[test]
    fn root_prefix_is_normalized() {
        let store = test_store("/sets/home/");
        assert_eq!(store.full_key("manifest"), "sets/home/manifest");
    }

    #[test]
    fn rejects_invalid_endpoint() {
        assert!(S3Store::new("bucket", "not a url", "us-east-1", "k", "s", "").is_err());
    }

    #[test]
    fn retryable_errors_are_classified() {
        assert!(is_retryable(&ureq::Error::Status(
            500,
            ureq::Response::new(500, "Internal Server Error", "").unwrap()
        )));
        assert!(is_retryable(&ureq::Error::Status(
            429,
            ureq::Response::new(429, "Too Many Requests", "").unwrap()
        )));
        assert!(!is_retryable(&ureq::Error::Status(
            403,
            ureq::Response::new(403, "Forbidden", "").unwrap()
        )));
    }
}
