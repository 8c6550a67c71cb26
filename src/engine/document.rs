use async_graphql::parser::parse_query;
use async_graphql::parser::types::{
    DocumentOperations, ExecutableDocument, OperationDefinition, OperationType, Selection,
    SelectionSet,
};
use std::collections::HashSet;

/// Why a document cannot be registered as a subscription
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DocumentError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unknown operation named '{0}'")]
    UnknownOperation(String),
    #[error("operation name is required when the document has several operations")]
    OperationNameRequired,
    #[error("operation is not a subscription")]
    NotASubscription,
    #[error("subscription selects no field")]
    NoRootField,
    #[error("subscription must select exactly one root field, found {0}")]
    MultipleRootFields(usize),
    #[error("unknown fragment '{0}'")]
    UnknownFragment(String),
}

/// Resolve the single root field selected by the subscription operation of
/// `query` (the operation named `operation_name`, or the only operation).
pub fn subscription_target(
    query: &str,
    operation_name: Option<&str>,
) -> Result<String, DocumentError> {
    let document = parse_query(query).map_err(|e| DocumentError::Syntax(e.to_string()))?;
    let operation = select_operation(&document, operation_name)?;

    if operation.ty != OperationType::Subscription {
        return Err(DocumentError::NotASubscription);
    }

    let mut fields = Vec::new();
    let mut visited = HashSet::new();
    collect_root_fields(&document, &operation.selection_set.node, &mut fields, &mut visited)?;

    match fields.len() {
        0 => Err(DocumentError::NoRootField),
        1 => Ok(fields.remove(0)),
        n => Err(DocumentError::MultipleRootFields(n)),
    }
}

fn select_operation<'a>(
    document: &'a ExecutableDocument,
    operation_name: Option<&str>,
) -> Result<&'a OperationDefinition, DocumentError> {
    match (&document.operations, operation_name) {
        (DocumentOperations::Single(operation), None) => Ok(&operation.node),
        (DocumentOperations::Single(_), Some(name)) => {
            Err(DocumentError::UnknownOperation(name.to_string()))
        }
        (DocumentOperations::Multiple(operations), Some(name)) => operations
            .iter()
            .find(|(op_name, _)| op_name.as_str() == name)
            .map(|(_, operation)| &operation.node)
            .ok_or_else(|| DocumentError::UnknownOperation(name.to_string())),
        (DocumentOperations::Multiple(operations), None) => {
            let mut all = operations.values();
            match (all.next(), all.next()) {
                (Some(only), None) => Ok(&only.node),
                _ => Err(DocumentError::OperationNameRequired),
            }
        }
    }
}

/// Distinct field names selected at the root, expanding fragments.
fn collect_root_fields(
    document: &ExecutableDocument,
    selection_set: &SelectionSet,
    fields: &mut Vec<String>,
    visited: &mut HashSet<String>,
) -> Result<(), DocumentError> {
    for selection in &selection_set.items {
        match &selection.node {
            Selection::Field(field) => {
                let name = field.node.name.node.to_string();
                if !fields.contains(&name) {
                    fields.push(name);
                }
            }
            Selection::InlineFragment(fragment) => {
                collect_root_fields(document, &fragment.node.selection_set.node, fields, visited)?;
            }
            Selection::FragmentSpread(spread) => {
                let name = spread.node.fragment_name.node.to_string();
                if !visited.insert(name.clone()) {
                    continue;
                }
                let fragment = document
                    .fragments
                    .iter()
                    .find(|(fragment_name, _)| fragment_name.as_str() == name)
                    .map(|(_, fragment)| fragment)
                    .ok_or(DocumentError::UnknownFragment(name))?;
                collect_root_fields(document, &fragment.node.selection_set.node, fields, visited)?;
            }
        }
    }
    Ok(())
}
