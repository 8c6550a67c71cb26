//! Chat schema served by the `gql-fanout` binary.
//!
//! Subscription resolvers here are pure transformations of the published
//! payload: they decode it and yield it once.

use crate::engine::{AsyncGraphQlExecutor, EventPayload};
use crate::subscription::FilterTable;
use async_graphql::{Context, EmptyMutation, Object, Result, Schema, SimpleObject, Subscription};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{Map, Value};

pub type ChatSchema = Schema<QueryRoot, EmptyMutation, SubscriptionRoot>;
pub type ChatExecutor = AsyncGraphQlExecutor<QueryRoot, EmptyMutation, SubscriptionRoot>;

#[derive(Debug, Clone, Deserialize, SimpleObject)]
pub struct ChatMessage {
    pub room: String,
    pub text: String,
    #[serde(default)]
    pub author: Option<String>,
}

#[derive(Debug, Clone, Deserialize, SimpleObject)]
pub struct UserJoined {
    pub room: String,
    pub name: String,
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    async fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}

pub struct SubscriptionRoot;

#[Subscription]
impl SubscriptionRoot {
    /// A message was posted. `room` narrows delivery through the room filter
    /// when passed as a variable.
    async fn message_added(
        &self,
        ctx: &Context<'_>,
        #[graphql(name = "room")] _room: Option<String>,
    ) -> Result<impl Stream<Item = ChatMessage>> {
        let message: ChatMessage = ctx.data::<EventPayload>()?.decode()?;
        Ok(stream::once(async move { message }))
    }

    async fn user_joined(
        &self,
        ctx: &Context<'_>,
        #[graphql(name = "room")] _room: Option<String>,
    ) -> Result<impl Stream<Item = UserJoined>> {
        let joined: UserJoined = ctx.data::<EventPayload>()?.decode()?;
        Ok(stream::once(async move { joined }))
    }
}

pub fn build_schema() -> ChatSchema {
    Schema::build(QueryRoot, EmptyMutation, SubscriptionRoot).finish()
}

pub fn build_executor() -> ChatExecutor {
    AsyncGraphQlExecutor::new(build_schema())
}

/// Delivers only events whose `room` equals the subscriber's `room`
/// variable. Subscribers without a `room` variable receive every room.
pub fn room_filter(payload: &Value, variables: &Map<String, Value>, _context: &Value) -> bool {
    match variables.get("room") {
        Some(Value::Null) | None => true,
        Some(room) => payload.get("room") == Some(room),
    }
}

pub fn filters() -> FilterTable {
    FilterTable::new()
        .with("messageAdded", room_filter)
        .with("userJoined", room_filter)
}
