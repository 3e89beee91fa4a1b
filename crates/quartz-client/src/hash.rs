//! Typed wrappers for standard hash commands.
//!
//! [`HashKey`] binds a client to one hash key and turns raw reply trees
//! into Rust types, mapping nil and error replies into [`ReplyError`]
//! instead of panicking on surprising shapes.

use std::collections::HashMap;

use quartz_protocol::Reply;

use crate::client::{unexpected, Client};
use crate::error::ReplyError;

/// Hash commands against one key.
///
/// ```no_run
/// # async fn example(client: quartz_client::Client) -> Result<(), quartz_client::ReplyError> {
/// let settings = client.hash("settings");
/// settings.hset("mode", "active").await?;
/// assert_eq!(settings.hget("mode").await?, Some("active".to_string()));
/// # Ok(())
/// # }
/// ```
pub struct HashKey<'c> {
    client: &'c Client,
    key: String,
}

impl<'c> HashKey<'c> {
    pub(crate) fn new(client: &'c Client, key: String) -> Self {
        Self { client, key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// `HGET` — the field's value, or `None` when absent.
    pub async fn hget(&self, field: &str) -> Result<Option<String>, ReplyError> {
        match self.client.exec(&["HGET", &self.key, field]).await {
            Some(Reply::Bulk(data)) => Ok(Some(utf8(&data)?)),
            Some(Reply::Nil) => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    /// `HSET` — true when the field was newly created.
    pub async fn hset(&self, field: &str, value: &str) -> Result<bool, ReplyError> {
        Ok(self.integer(&["HSET", &self.key, field, value]).await? == 1)
    }

    /// `HMSET`-style batch set.
    pub async fn hset_batch(&self, pairs: &[(&str, &str)]) -> Result<(), ReplyError> {
        let mut argv: Vec<&str> = Vec::with_capacity(2 + pairs.len() * 2);
        argv.push("HMSET");
        argv.push(&self.key);
        for (field, value) in pairs {
            argv.push(field);
            argv.push(value);
        }

        match self.client.exec(&argv).await {
            Some(Reply::Status(s)) if s == "OK" => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// `HDEL` — true when the field existed.
    pub async fn hdel(&self, field: &str) -> Result<bool, ReplyError> {
        Ok(self.integer(&["HDEL", &self.key, field]).await? == 1)
    }

    /// `HEXISTS`.
    pub async fn hexists(&self, field: &str) -> Result<bool, ReplyError> {
        Ok(self.integer(&["HEXISTS", &self.key, field]).await? == 1)
    }

    /// `HLEN` — number of fields.
    pub async fn hlen(&self) -> Result<i64, ReplyError> {
        self.integer(&["HLEN", &self.key]).await
    }

    /// `HGETALL` — every field and value.
    pub async fn hgetall(&self) -> Result<HashMap<String, String>, ReplyError> {
        match self.client.exec(&["HGETALL", &self.key]).await {
            Some(Reply::Array(items)) => kv_map(&items),
            other => Err(unexpected(other)),
        }
    }

    /// `HKEYS`.
    pub async fn hkeys(&self) -> Result<Vec<String>, ReplyError> {
        self.string_list(&["HKEYS", &self.key]).await
    }

    /// `HVALS`.
    pub async fn hvals(&self) -> Result<Vec<String>, ReplyError> {
        self.string_list(&["HVALS", &self.key]).await
    }

    /// `HINCRBY` — the field's value after the increment.
    pub async fn hincrby(&self, field: &str, delta: i64) -> Result<i64, ReplyError> {
        self.integer(&["HINCRBY", &self.key, field, &delta.to_string()])
            .await
    }

    /// `HINCRBYFLOAT` — the field's value after the increment.
    pub async fn hincrbyfloat(&self, field: &str, delta: f64) -> Result<f64, ReplyError> {
        match self
            .client
            .exec(&["HINCRBYFLOAT", &self.key, field, &delta.to_string()])
            .await
        {
            Some(Reply::Bulk(data)) => {
                let text = utf8(&data)?;
                text.parse()
                    .map_err(|_| ReplyError::Unexpected(format!("not a float: \"{text}\"")))
            }
            other => Err(unexpected(other)),
        }
    }

    /// One `HSCAN` step. Returns the next cursor (zero when the
    /// iteration is complete) and the fields of this batch.
    pub async fn hscan(&self, cursor: u64) -> Result<(u64, HashMap<String, String>), ReplyError> {
        match self
            .client
            .exec(&["HSCAN", &self.key, &cursor.to_string()])
            .await
        {
            Some(Reply::Array(items)) if items.len() == 2 => {
                let next = match &items[0] {
                    Reply::Bulk(data) => utf8(data)?
                        .parse()
                        .map_err(|_| ReplyError::Unexpected("non-numeric scan cursor".into()))?,
                    other => return Err(unexpected(Some(other.clone()))),
                };
                let fields = match &items[1] {
                    Reply::Array(pairs) => kv_map(pairs)?,
                    other => return Err(unexpected(Some(other.clone()))),
                };
                Ok((next, fields))
            }
            other => Err(unexpected(other)),
        }
    }

    async fn integer(&self, argv: &[&str]) -> Result<i64, ReplyError> {
        match self.client.exec(argv).await {
            Some(Reply::Integer(n)) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    async fn string_list(&self, argv: &[&str]) -> Result<Vec<String>, ReplyError> {
        match self.client.exec(argv).await {
            Some(Reply::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Reply::Bulk(data) => utf8(data),
                    other => Err(unexpected(Some(other.clone()))),
                })
                .collect(),
            other => Err(unexpected(other)),
        }
    }
}

/// Interprets a flat `[k1, v1, k2, v2, …]` reply as a map.
fn kv_map(items: &[Reply]) -> Result<HashMap<String, String>, ReplyError> {
    if items.len() % 2 != 0 {
        return Err(ReplyError::Unexpected(
            "odd number of elements in field-value reply".into(),
        ));
    }

    let mut map = HashMap::with_capacity(items.len() / 2);
    for chunk in items.chunks_exact(2) {
        let field = match &chunk[0] {
            Reply::Bulk(data) => utf8(data)?,
            other => return Err(unexpected(Some(other.clone()))),
        };
        let value = match &chunk[1] {
            Reply::Bulk(data) => utf8(data)?,
            other => return Err(unexpected(Some(other.clone()))),
        };
        map.insert(field, value);
    }
    Ok(map)
}

fn utf8(data: &bytes::Bytes) -> Result<String, ReplyError> {
    String::from_utf8(data.to_vec())
        .map_err(|_| ReplyError::Unexpected("invalid utf-8 in reply".into()))
}
