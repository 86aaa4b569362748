//! Redis-backed script store.
//!
//! The connection is opened lazily on first use and shared by all callers;
//! a dropped or failed connection is discarded so the next call reconnects.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use halyard_core::{Connector, Error, LazyConnection, Result};

use super::{EvalError, ScriptStore, ScriptValue};

/// Opens multiplexed Redis connections.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: redis::Client,
}

impl RedisConnector {
    /// Validates `url` without connecting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if the URL is not a valid Redis URL.
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::cache_with_source("invalid cache URL", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Connection = MultiplexedConnection;

    async fn connect(&self) -> Result<Self::Connection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::cache_with_source("failed to connect to cache", e))
    }
}

/// [`ScriptStore`] over a Redis server.
#[derive(Debug)]
pub struct RedisScriptStore {
    connection: LazyConnection<RedisConnector>,
}

impl RedisScriptStore {
    /// Creates a store that connects to `url` on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if the URL is invalid.
    pub fn open(url: &str) -> Result<Self> {
        Ok(Self {
            connection: LazyConnection::new(RedisConnector::new(url)?),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.connection.get().await?.as_ref().clone())
    }

    async fn failure(&self, command: &str, err: redis::RedisError) -> Error {
        if err.is_connection_dropped() || err.is_io_error() || err.is_connection_refusal() {
            self.connection.invalidate().await;
        }
        Error::cache_with_source(format!("cache command {command} failed"), err)
    }
}

#[async_trait]
impl ScriptStore for RedisScriptStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<Option<String>> =
            redis::cmd("GET").arg(key).query_async(&mut conn).await;
        match result {
            Ok(value) => Ok(value),
            Err(err) => Err(self.failure("GET", err).await),
        }
    }

    async fn set_persistent(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self.failure("SET", err).await),
        }
    }

    async fn load_script(&self, body: &str) -> Result<String> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<String> = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(body)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(handle) => Ok(handle),
            Err(err) => Err(self.failure("SCRIPT LOAD", err).await),
        }
    }

    async fn eval_handle(
        &self,
        handle: &str,
        keys: &[String],
        args: &[String],
    ) -> std::result::Result<ScriptValue, EvalError> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<redis::Value> = redis::cmd("EVALSHA")
            .arg(handle)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(value) => Ok(convert(value)),
            Err(err) if err.kind() == redis::ErrorKind::NoScriptError => {
                Err(EvalError::UnknownHandle)
            }
            Err(err) => Err(self.failure("EVALSHA", err).await.into()),
        }
    }
}

fn convert(value: redis::Value) -> ScriptValue {
    match value {
        redis::Value::Nil => ScriptValue::Nil,
        redis::Value::Int(n) => ScriptValue::Int(n),
        redis::Value::Okay => ScriptValue::Text("OK".to_string()),
        redis::Value::SimpleString(text) => ScriptValue::Text(text),
        redis::Value::BulkString(bytes) => {
            ScriptValue::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        redis::Value::Boolean(flag) => ScriptValue::Int(i64::from(flag)),
        redis::Value::Array(items) | redis::Value::Set(items) => {
            ScriptValue::Array(items.into_iter().map(convert).collect())
        }
        other => ScriptValue::Text(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_url_is_a_cache_error() {
        let err = RedisScriptStore::open("not a url").err();
        assert!(matches!(err, Some(Error::Cache { .. })));
    }

    #[test]
    fn nested_replies_convert() {
        let value = redis::Value::Array(vec![
            redis::Value::Int(1),
            redis::Value::BulkString(b"token".to_vec()),
            redis::Value::Nil,
        ]);
        assert_eq!(
            convert(value),
            ScriptValue::Array(vec![
                ScriptValue::Int(1),
                ScriptValue::Text("token".into()),
                ScriptValue::Nil,
            ])
        );
    }
}
