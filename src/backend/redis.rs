use std::{collections::HashMap, time::Duration};

use redis::{
    Client, Cmd, FromRedisValue,
    aio::ConnectionManager,
    streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadReply},
};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    Error, Result,
    backend::{PendingEntry, StreamClient, StreamEntry, StreamStats},
};

/// Longest single XREADGROUP block; longer waits are issued in slices so a
/// read never outlives the connection's response timeout.
const MAX_BLOCK_SLICE: Duration = Duration::from_millis(250);

/// [`StreamClient`] over Redis Streams.
///
/// Blocking reads run on their own connection so they never stall the
/// commands issued meanwhile.
pub struct RedisStreams {
    client: Client,
    /// `None` once closed.
    connections: RwLock<Option<Connections>>,
}

#[derive(Clone)]
struct Connections {
    commands: ConnectionManager,
    reads: ConnectionManager,
}

impl Connections {
    async fn open(client: &Client) -> Result<Self> {
        Ok(Connections {
            commands: ConnectionManager::new(client.clone()).await?,
            reads: ConnectionManager::new(client.clone()).await?,
        })
    }
}

impl RedisStreams {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| Error::backend(format!("invalid redis url: {e}")))?;
        let connections = Connections::open(&client).await?;
        info!(url = %redacted(url), "connected to redis");
        Ok(Self {
            client,
            connections: RwLock::new(Some(connections)),
        })
    }

    async fn connections(&self) -> Result<Connections> {
        self.connections
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::backend("redis client closed"))
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        let mut conn = self.connections().await?.commands;
        Ok(cmd.query_async(&mut conn).await?)
    }

    async fn read_once(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(1);
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(stream).arg(">");

        let mut conn = self.connections().await?.reads;
        let reply: Option<StreamReadReply> = cmd.query_async(&mut conn).await?;
        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next())
            .map(to_entry))
    }
}

impl StreamClient for RedisStreams {
    async fn ping(&self) -> Result<()> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        let mut connections = self.connections.write().await;
        if connections.is_none() {
            return Err(Error::backend("redis client closed"));
        }
        *connections = Some(Connections::open(&self.client).await?);
        Ok(())
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg("0").arg("MKSTREAM");
        let mut conn = self.connections().await?.commands;
        match cmd.query_async::<()>(&mut conn).await {
            Ok(()) => {
                debug!(stream, group, "created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (k, v) in fields {
            cmd.arg(*k).arg(*v);
        }
        self.query(&cmd).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let slice = remaining.min(MAX_BLOCK_SLICE);
            let entry = self.read_once(stream, group, consumer, slice).await?;
            if entry.is_some() || remaining <= MAX_BLOCK_SLICE {
                return Ok(entry);
            }
        }
    }

    async fn pending(&self, stream: &str, group: &str, count: usize) -> Result<Vec<PendingEntry>> {
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream).arg(group).arg("-").arg("+").arg(count);
        let reply: StreamPendingCountReply = self.query(&cmd).await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                deliveries: p.times_delivered as u64,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        id: &str,
    ) -> Result<Option<StreamEntry>> {
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(id);
        let reply: StreamClaimReply = self.query(&cmd).await?;
        Ok(reply.ids.into_iter().next().map(to_entry))
    }

    async fn range(&self, stream: &str, start: &str, end: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(stream).arg(start).arg(end).arg("COUNT").arg(count);
        let reply: StreamRangeReply = self.query(&cmd).await?;
        Ok(reply.ids.into_iter().map(to_entry).collect())
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group).arg(id);
        let _: i64 = self.query(&cmd).await?;
        Ok(())
    }

    async fn stats(&self, stream: &str, group: &str) -> Result<StreamStats> {
        let length: u64 = self.query(redis::cmd("XLEN").arg(stream)).await?;
        if length == 0 {
            return Ok(StreamStats::default());
        }

        let groups: Vec<HashMap<String, Option<String>>> = self
            .query(redis::cmd("XINFO").arg("GROUPS").arg(stream))
            .await?;
        let info = groups
            .iter()
            .find(|g| g.get("name").and_then(Option::as_deref) == Some(group));
        let number = |key: &str| {
            info.and_then(|g| g.get(key))
                .and_then(Option::as_deref)
                .and_then(|v| v.parse::<u64>().ok())
        };

        Ok(StreamStats {
            length,
            pending: number("pending").unwrap_or(0),
            lag: number("lag"),
        })
    }

    async fn close(&self) -> Result<()> {
        if self.connections.write().await.take().is_some() {
            info!("closed redis connections");
        }
        Ok(())
    }
}

fn to_entry(id: StreamId) -> StreamEntry {
    let fields = id
        .map
        .keys()
        .filter_map(|k| id.get::<String>(k).map(|v| (k.clone(), v)))
        .collect();
    StreamEntry { id: id.id, fields }
}

/// Strip credentials from a connection url before logging it.
fn redacted(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}://***{}", &url[..scheme], &url[at..]),
        _ => url.to_owned(),
    }
}
