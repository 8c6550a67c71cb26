use crate::engine::{ExecutionRequest, ExecutionResult, Executor, GraphQlError, Location};
use async_graphql::parser::parse_schema;
use async_graphql::parser::types::{TypeKind, TypeSystemDefinition};
use async_graphql::{ObjectType, Request, Response, Schema, ServerError, SubscriptionType, Variables};
use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::warn;

/// The published event, available to subscription resolvers via
/// `ctx.data::<EventPayload>()`.
#[derive(Debug, Clone)]
pub struct EventPayload(pub Value);

impl EventPayload {
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.0.clone())
    }
}

/// Server-level context, available to resolvers via `ctx.data::<EventContext>()`.
#[derive(Debug, Clone)]
pub struct EventContext(pub Value);

/// Executor backed by an `async_graphql::Schema`.
///
/// Subscription resolvers are expected to build their item from
/// [`EventPayload`] and yield it once; only the first item of the response
/// stream is used per event.
pub struct AsyncGraphQlExecutor<Query, Mutation, Subscription> {
    schema: Schema<Query, Mutation, Subscription>,
    subscription_fields: HashSet<String>,
}

impl<Query, Mutation, Subscription> AsyncGraphQlExecutor<Query, Mutation, Subscription>
where
    Query: ObjectType + 'static,
    Mutation: ObjectType + 'static,
    Subscription: SubscriptionType + 'static,
{
    pub fn new(schema: Schema<Query, Mutation, Subscription>) -> Self {
        let subscription_fields = subscription_fields_from_sdl(&schema.sdl());
        Self {
            schema,
            subscription_fields,
        }
    }

    pub fn schema(&self) -> &Schema<Query, Mutation, Subscription> {
        &self.schema
    }

    pub fn subscription_fields(&self) -> &HashSet<String> {
        &self.subscription_fields
    }
}

#[async_trait]
impl<Query, Mutation, Subscription> Executor for AsyncGraphQlExecutor<Query, Mutation, Subscription>
where
    Query: ObjectType + 'static,
    Mutation: ObjectType + 'static,
    Subscription: SubscriptionType + 'static,
{
    fn has_subscription_field(&self, name: &str) -> bool {
        self.subscription_fields.contains(name)
    }

    async fn validate(
        &self,
        query: &str,
        variables: &Map<String, Value>,
        operation_name: Option<&str>,
    ) -> Result<(), Vec<GraphQlError>> {
        let mut gql_request = Request::new(query)
            .variables(Variables::from_json(Value::Object(variables.clone())))
            .data(EventPayload(Value::Null))
            .data(EventContext(Value::Null));
        if let Some(operation_name) = operation_name {
            gql_request = gql_request.operation_name(operation_name);
        }

        let Some(response) = self.schema.execute_stream(gql_request).next().await else {
            return Ok(());
        };

        // Validation errors are reported before any resolver runs and carry
        // no path; resolver errors on the null payload are expected.
        let errors: Vec<GraphQlError> = response
            .errors
            .into_iter()
            .filter(|error| error.path.is_empty())
            .map(convert_error)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let mut gql_request = Request::new(request.query)
            .variables(Variables::from_json(Value::Object(request.variables)))
            .data(EventPayload(request.root_value))
            .data(EventContext(request.context));
        if let Some(operation_name) = request.operation_name {
            gql_request = gql_request.operation_name(operation_name);
        }

        let mut responses = self.schema.execute_stream(gql_request);
        match responses.next().await {
            Some(response) => convert_response(response),
            None => ExecutionResult::error("subscription produced no result for this event"),
        }
    }
}

fn convert_response(response: Response) -> ExecutionResult {
    let data = match response.data.into_json() {
        Ok(Value::Null) => None,
        Ok(data) => Some(data),
        Err(e) => {
            warn!(error = %e, "Failed to convert GraphQL response data to JSON");
            None
        }
    };

    ExecutionResult {
        data,
        errors: response.errors.into_iter().map(convert_error).collect(),
    }
}

fn convert_error(error: ServerError) -> GraphQlError {
    GraphQlError {
        locations: error
            .locations
            .iter()
            .map(|pos| Location {
                line: pos.line,
                column: pos.column,
            })
            .collect(),
        path: if error.path.is_empty() {
            None
        } else {
            serde_json::to_value(&error.path).ok()
        },
        extensions: error
            .extensions
            .as_ref()
            .and_then(|ext| serde_json::to_value(ext).ok()),
        message: error.message,
    }
}

/// Root field names of the subscription type described by `sdl`.
fn subscription_fields_from_sdl(sdl: &str) -> HashSet<String> {
    let document = match parse_schema(sdl) {
        Ok(document) => document,
        Err(e) => {
            warn!(error = %e, "Failed to parse schema SDL, no subscription fields available");
            return HashSet::new();
        }
    };

    let root = document
        .definitions
        .iter()
        .find_map(|definition| match definition {
            TypeSystemDefinition::Schema(schema) => {
                schema.node.subscription.as_ref().map(|name| name.node.to_string())
            }
            _ => None,
        })
        .unwrap_or_else(|| "Subscription".to_string());

    document
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            TypeSystemDefinition::Type(ty) if ty.node.name.node.as_str() == root => {
                match &ty.node.kind {
                    TypeKind::Object(object) => Some(
                        object
                            .fields
                            .iter()
                            .map(|field| field.node.name.node.to_string())
                            .collect::<Vec<_>>(),
                    ),
                    _ => None,
                }
            }
            _ => None,
        })
        .flatten()
        .collect()
}
