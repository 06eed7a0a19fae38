use tracing::info;

use visitflow_core::error::{Result, VisitflowError};
use visitflow_core::settings::{CodeOp, CustomCode};
use visitflow_core::traits::TagStore;
use visitflow_core::types::Job;

use crate::template::Template;

/// Run the declarative operations in order, stopping at the first failure.
///
/// Free-form scripts are refused. Every failure surfaces as
/// `VisitflowError::CustomCode`.
pub async fn run(
    code: &CustomCode,
    job: &Job,
    template: &Template<'_>,
    tags: &dyn TagStore,
) -> Result<String> {
    if code.legacy_script {
        return Err(VisitflowError::CustomCode(
            "free-form scripts are not executed; use declarative operations".into(),
        ));
    }

    for (i, op) in code.operations.iter().enumerate() {
        let step = i + 1;
        match op {
            CodeOp::AddTag { tag } => {
                let tag = non_empty(template.render(tag), step)?;
                tags.add_tag(&job.site_id, &job.visitor_id, &tag)
                    .await
                    .map_err(|e| op_error(step, e))?;
            }
            CodeOp::RemoveTag { tag } => {
                let tag = non_empty(template.render(tag), step)?;
                tags.remove_tag(&job.site_id, &job.visitor_id, &tag)
                    .await
                    .map_err(|e| op_error(step, e))?;
            }
            CodeOp::Log { message } => {
                info!(
                    workflow_id = %job.workflow_id,
                    node_id = %job.node_id,
                    visitor_id = %job.visitor_id,
                    message = %template.render(message),
                    "Custom code log"
                );
            }
            CodeOp::Fail { message } => {
                return Err(VisitflowError::CustomCode(template.render(message)));
            }
        }
    }
    Ok(format!("{} operations executed", code.operations.len()))
}

fn non_empty(tag: String, step: usize) -> Result<String> {
    let tag = tag.trim().to_string();
    if tag.is_empty() {
        return Err(VisitflowError::CustomCode(format!(
            "operation {}: tag renders empty",
            step
        )));
    }
    Ok(tag)
}

fn op_error(step: usize, e: VisitflowError) -> VisitflowError {
    VisitflowError::CustomCode(format!("operation {}: {}", step, e))
}
