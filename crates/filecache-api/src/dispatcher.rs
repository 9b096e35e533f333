//! Command dispatcher
//!
//! Maps bus commands and their named arguments onto cache manager
//! operations and shapes the replies.

use filecache_core::{CacheManager, Subscription};
use metrics::counter;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::error::BusError;

/// Version reported by `GetVersion`
pub const SERVICE_VERSION: &str = "1.0";

/// Commands understood by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    DefineType,
    ChangeType,
    DeleteType,
    DescribeType,
    InsertCacheObject,
    ResizeCacheObject,
    ExpireCacheObject,
    DeleteCacheObject,
    SubscribeCacheObject,
    TouchCacheObject,
    CopyCacheObject,
    GetCacheStatus,
    GetCacheTypeStatus,
    GetCacheObjectSize,
    GetCacheObjectFilename,
    GetCacheTypes,
    GetVersion,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::DefineType => "DefineType",
            Command::ChangeType => "ChangeType",
            Command::DeleteType => "DeleteType",
            Command::DescribeType => "DescribeType",
            Command::InsertCacheObject => "InsertCacheObject",
            Command::ResizeCacheObject => "ResizeCacheObject",
            Command::ExpireCacheObject => "ExpireCacheObject",
            Command::DeleteCacheObject => "DeleteCacheObject",
            Command::SubscribeCacheObject => "SubscribeCacheObject",
            Command::TouchCacheObject => "TouchCacheObject",
            Command::CopyCacheObject => "CopyCacheObject",
            Command::GetCacheStatus => "GetCacheStatus",
            Command::GetCacheTypeStatus => "GetCacheTypeStatus",
            Command::GetCacheObjectSize => "GetCacheObjectSize",
            Command::GetCacheObjectFilename => "GetCacheObjectFilename",
            Command::GetCacheTypes => "GetCacheTypes",
            Command::GetVersion => "GetVersion",
        }
    }

    pub const ALL: [Command; 17] = [
        Command::DefineType,
        Command::ChangeType,
        Command::DeleteType,
        Command::DescribeType,
        Command::InsertCacheObject,
        Command::ResizeCacheObject,
        Command::ExpireCacheObject,
        Command::DeleteCacheObject,
        Command::SubscribeCacheObject,
        Command::TouchCacheObject,
        Command::CopyCacheObject,
        Command::GetCacheStatus,
        Command::GetCacheTypeStatus,
        Command::GetCacheObjectSize,
        Command::GetCacheObjectFilename,
        Command::GetCacheTypes,
        Command::GetVersion,
    ];
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| BusError::UnknownCommand(s.to_string()))
    }
}

/// Successful reply
#[derive(Debug)]
pub struct Reply {
    /// Reply body, always carrying `returnValue: true`
    pub payload: Value,
    /// Set when the call registered an eviction subscription
    pub subscription: Option<Subscription>,
}

impl Reply {
    fn ok(fields: Value) -> Self {
        let mut payload = Map::new();
        payload.insert("returnValue".to_string(), Value::Bool(true));
        if let Value::Object(fields) = fields {
            payload.extend(fields);
        }
        Self {
            payload: Value::Object(payload),
            subscription: None,
        }
    }

    fn with_subscription(mut self, subscription: Option<Subscription>) -> Self {
        self.subscription = subscription;
        self
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DefineTypeArgs {
    type_name: String,
    lo_watermark: i64,
    hi_watermark: i64,
    #[serde(default)]
    size: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeTypeArgs {
    type_name: String,
    lo_watermark: Option<i64>,
    hi_watermark: Option<i64>,
    size: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeNameArgs {
    type_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertArgs {
    type_name: String,
    file_name: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    subscribe: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResizeArgs {
    path_name: String,
    new_size: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathNameArgs {
    path_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeArgs {
    path_name: String,
    #[serde(default = "default_true")]
    subscribe: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CopyArgs {
    path_name: String,
    destination: Option<String>,
    file_name: Option<String>,
}

fn default_true() -> bool {
    true
}

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, BusError> {
    let args = match args {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(args).map_err(|e| BusError::InvalidArgs(e.to_string()))
}

/// Command dispatcher
pub struct Dispatcher {
    cache: Arc<CacheManager>,
}

impl Dispatcher {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self { cache }
    }

    /// Execute `command` with its named arguments
    pub async fn call(&self, command: &str, args: Value) -> Result<Reply, BusError> {
        let command: Command = command.parse()?;
        counter!("filecache_bus_calls_total", "command" => command.as_str()).increment(1);
        debug!("Bus call {} {}", command, args);

        let cache = &self.cache;
        let reply = match command {
            Command::DefineType => {
                let args: DefineTypeArgs = parse_args(args)?;
                cache
                    .define_type(&args.type_name, args.lo_watermark, args.hi_watermark, args.size)
                    .await?;
                Reply::ok(json!({}))
            }
            Command::ChangeType => {
                let args: ChangeTypeArgs = parse_args(args)?;
                cache
                    .change_type(&args.type_name, args.lo_watermark, args.hi_watermark, args.size)
                    .await?;
                Reply::ok(json!({}))
            }
            Command::DeleteType => {
                let args: TypeNameArgs = parse_args(args)?;
                let freed = cache.delete_type(&args.type_name).await?;
                Reply::ok(json!({ "freedSpace": freed }))
            }
            Command::DescribeType => {
                let args: TypeNameArgs = parse_args(args)?;
                let params = cache.describe_type(&args.type_name)?;
                Reply::ok(json!({
                    "loWatermark": params.lo_watermark,
                    "hiWatermark": params.hi_watermark,
                    "size": params.default_size,
                }))
            }
            Command::InsertCacheObject => {
                let args: InsertArgs = parse_args(args)?;
                let inserted = cache
                    .insert(&args.type_name, &args.file_name, args.size, args.subscribe)
                    .await?;
                Reply::ok(json!({
                    "pathName": inserted.path_name,
                    "subscribed": inserted.subscription.is_some(),
                }))
                .with_subscription(inserted.subscription)
            }
            Command::ResizeCacheObject => {
                let args: ResizeArgs = parse_args(args)?;
                let new_size = cache.resize(&args.path_name, args.new_size).await?;
                Reply::ok(json!({ "newSize": new_size }))
            }
            Command::ExpireCacheObject | Command::DeleteCacheObject => {
                let args: PathNameArgs = parse_args(args)?;
                cache.delete_object(&args.path_name).await?;
                Reply::ok(json!({}))
            }
            Command::SubscribeCacheObject => {
                let args: SubscribeArgs = parse_args(args)?;
                let subscription = cache.subscribe(&args.path_name, args.subscribe).await?;
                Reply::ok(json!({ "subscribed": subscription.is_some() }))
                    .with_subscription(subscription)
            }
            Command::TouchCacheObject => {
                let args: PathNameArgs = parse_args(args)?;
                cache.touch(&args.path_name).await?;
                Reply::ok(json!({}))
            }
            Command::CopyCacheObject => {
                let args: CopyArgs = parse_args(args)?;
                let copied = cache
                    .copy_object(
                        &args.path_name,
                        args.destination.as_deref().map(Path::new),
                        args.file_name.as_deref(),
                    )
                    .await?;
                Reply::ok(json!({ "newPathName": copied.to_string_lossy() }))
            }
            Command::GetCacheStatus => {
                let status = cache.cache_status();
                Reply::ok(json!({
                    "numTypes": status.num_types,
                    "size": status.size,
                    "numObjs": status.num_objects,
                    "availSpace": status.avail_space,
                }))
            }
            Command::GetCacheTypeStatus => {
                let args: TypeNameArgs = parse_args(args)?;
                let status = cache.type_status(&args.type_name)?;
                Reply::ok(json!({
                    "size": status.size,
                    "numObjs": status.num_objects,
                }))
            }
            Command::GetCacheObjectSize => {
                let args: PathNameArgs = parse_args(args)?;
                let size = cache.object_size(&args.path_name).await?;
                Reply::ok(json!({ "size": size }))
            }
            Command::GetCacheObjectFilename => {
                let args: PathNameArgs = parse_args(args)?;
                let file_name = cache.object_file_name(&args.path_name).await?;
                Reply::ok(json!({ "fileName": file_name }))
            }
            Command::GetCacheTypes => Reply::ok(json!({ "types": cache.type_names() })),
            Command::GetVersion => Reply::ok(json!({ "version": SERVICE_VERSION })),
        };

        Ok(reply)
    }
}
