//! Server-side token bucket script
//!
//! Bucket parameters are written into the script body as literals, so every
//! distinct [`Limits`] produces a distinct script and fingerprint.

use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::config::Limits;
use crate::connection::Connection;
use crate::error::{Result, StoreError};
use crate::resp::Reply;

const TEMPLATE: &str = include_str!("token_bucket.lua");

/// Reply of one script invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketReply {
    /// Tokens left after this call
    pub remaining: u64,
    /// Nanosecond timestamp at which the bucket is full again
    pub reset: u64,
    pub allowed: bool,
}

impl BucketReply {
    /// Read the `[remaining, reset, allowed]` integer triple
    pub fn from_reply(reply: &Reply) -> Result<Self> {
        let items = reply.as_array()?;
        if items.len() < 3 {
            return Err(StoreError::protocol(format!(
                "expected 3 elements in script reply, got {}",
                items.len()
            )));
        }

        Ok(Self {
            remaining: items[0].as_u64()?,
            reset: items[1].as_u64()?,
            allowed: items[2].as_u64()? != 0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    body: String,
    sha: String,
}

impl Script {
    pub fn build(limits: &Limits) -> Self {
        let body = TEMPLATE
            .replace("{{TOKENS}}", &limits.tokens.to_string())
            .replace("{{INTERVAL}}", &limits.interval.as_nanos().to_string())
            .replace("{{RATE}}", &limits.rate.to_string())
            .replace("{{TTL}}", &limits.ttl.to_string());
        let sha = hex::encode(Sha1::digest(body.as_bytes()));

        Self { body, sha }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Hex SHA-1 of the body, as the server's script cache names it
    pub fn sha(&self) -> &str {
        &self.sha
    }

    /// Upload the script into the server's script cache
    pub async fn register(&self, conn: &mut Connection) -> Result<()> {
        let reply = conn.request(&["SCRIPT", "LOAD", self.body.as_str()]).await?;

        match reply.as_str() {
            Ok(sha) if sha.eq_ignore_ascii_case(&self.sha) => {
                debug!(sha = %self.sha, "script registered");
            }
            Ok(sha) => {
                warn!(expected = %self.sha, got = %sha, "server reported a different script fingerprint");
            }
            Err(e) => {
                warn!(error = %e, "unexpected SCRIPT LOAD reply");
            }
        }
        Ok(())
    }

    /// Run the script for `key` at `now_ns`
    ///
    /// The body is sent in full on every call rather than by fingerprint.
    pub async fn eval(&self, conn: &mut Connection, key: &str, now_ns: u64) -> Result<BucketReply> {
        let now = now_ns.to_string();
        let reply = conn
            .request(&["EVAL", self.body.as_str(), "1", key, now.as_str()])
            .await?;
        BucketReply::from_reply(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use bytes::Bytes;
    use std::time::Duration;

    fn limits(tokens: u64, interval: Duration) -> Limits {
        Config::new()
            .tokens(tokens)
            .interval(interval)
            .limits()
            .unwrap()
    }

    #[test]
    fn test_build_embeds_parameters() {
        let script = Script::build(&limits(4, Duration::from_secs(2)));
        let body = script.body();

        assert!(body.contains("local tokens = 4\n"));
        assert!(body.contains("local interval = 2000000000\n"));
        assert!(body.contains("local rate = 500000000\n"));
        assert!(body.contains("local ttl = 20\n"));
        assert!(!body.contains("{{"));
    }

    #[test]
    fn test_build_fractional_rate() {
        let script = Script::build(&limits(3, Duration::from_secs(1)));
        assert!(script.body().contains("local rate = 333333333.333"));
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = Script::build(&limits(10, Duration::from_secs(60)));
        let b = Script::build(&limits(10, Duration::from_secs(60)));
        let c = Script::build(&limits(11, Duration::from_secs(60)));

        assert_eq!(a, b);
        assert_ne!(a.sha(), c.sha());
        assert_eq!(a.sha().len(), 40);
        assert!(a.sha().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sha_matches_body() {
        let script = Script::build(&limits(1, Duration::from_secs(1)));
        let expected = hex::encode(Sha1::digest(script.body().as_bytes()));
        assert_eq!(script.sha(), expected);
    }

    #[test]
    fn test_bucket_reply_parsing() {
        let reply = Reply::Array(vec![
            Reply::Integer(3),
            Reply::Integer(1_700_000_000_000_000_000),
            Reply::Integer(1),
        ]);
        assert_eq!(
            BucketReply::from_reply(&reply).unwrap(),
            BucketReply {
                remaining: 3,
                reset: 1_700_000_000_000_000_000,
                allowed: true,
            }
        );
    }

    #[test]
    fn test_bucket_reply_allowed_flag() {
        let reply = |flag| {
            Reply::Array(vec![Reply::Integer(0), Reply::Integer(5), Reply::Integer(flag)])
        };

        assert!(!BucketReply::from_reply(&reply(0)).unwrap().allowed);
        assert!(BucketReply::from_reply(&reply(1)).unwrap().allowed);
        assert!(BucketReply::from_reply(&reply(2)).unwrap().allowed);
    }

    #[test]
    fn test_bucket_reply_wrong_shape() {
        let short = Reply::Array(vec![Reply::Integer(1), Reply::Integer(2)]);
        assert!(BucketReply::from_reply(&short).is_err());

        let not_array = Reply::Status("OK".into());
        assert!(BucketReply::from_reply(&not_array).is_err());

        let bad_element = Reply::Array(vec![
            Reply::Integer(1),
            Reply::Bulk(Some(Bytes::from_static(b"soon"))),
            Reply::Integer(1),
        ]);
        assert!(BucketReply::from_reply(&bad_element).is_err());
    }
}
