//! Task catalog and client version checks.

use std::cmp::Ordering;

use ark_core::protocol::endpoints;
use ark_core::{ServerResponse, TaskDefinition};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::application::automate::RequestExchanger;

/// Errors produced while querying the catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no response from server")]
    NoResponse,

    #[error("server error: {0}")]
    Rejected(String),

    /// The success response lacked the expected field or it had the wrong shape.
    #[error("unexpected '{field}' in server response: {detail}")]
    Unexpected { field: &'static str, detail: String },
}

/// Result of comparing the running client with the published release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionStatus {
    pub current: String,
    pub latest: String,
    pub update_available: bool,
}

async fn call(
    exchanger: &dyn RequestExchanger,
    endpoint: &str,
    data: Value,
) -> Result<ServerResponse, CatalogError> {
    let raw = exchanger
        .exchange(endpoint, data)
        .await
        .ok_or(CatalogError::NoResponse)?;
    let response = ServerResponse::from_value(raw).map_err(|e| CatalogError::Unexpected {
        field: "status",
        detail: e.to_string(),
    })?;
    if !response.is_success() {
        return Err(CatalogError::Rejected(response.reason()));
    }
    Ok(response)
}

/// Downloads the task definitions the service offers.
pub async fn fetch_default_tasks(
    exchanger: &dyn RequestExchanger,
) -> Result<Vec<TaskDefinition>, CatalogError> {
    let response = call(exchanger, endpoints::GET_DEFAULT_TASKS, json!({})).await?;
    let tasks = response.field("tasks").cloned().ok_or(CatalogError::Unexpected {
        field: "tasks",
        detail: "missing".into(),
    })?;
    let tasks: Vec<TaskDefinition> =
        serde_json::from_value(tasks).map_err(|e| CatalogError::Unexpected {
            field: "tasks",
            detail: e.to_string(),
        })?;
    info!(count = tasks.len(), "fetched task catalog");
    Ok(tasks)
}

/// Asks the service for the latest client version.
pub async fn check_version(
    exchanger: &dyn RequestExchanger,
    current: &str,
) -> Result<VersionStatus, CatalogError> {
    let response = call(
        exchanger,
        endpoints::CHECK_VERSION,
        json!({ "version": current }),
    )
    .await?;
    let latest = response
        .str_field("latest_version")
        .or_else(|| response.str_field("version"))
        .ok_or(CatalogError::Unexpected {
            field: "latest_version",
            detail: "missing".into(),
        })?
        .to_string();
    let update_available = compare_versions(&latest, current) == Ordering::Greater;
    debug!(%current, %latest, update_available, "version check");
    Ok(VersionStatus {
        current: current.to_string(),
        latest,
        update_available,
    })
}

/// Compares dotted versions numerically; a leading `v` and non-numeric
/// suffixes are ignored, missing components count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts = |v: &str| -> Vec<u64> {
        v.trim()
            .trim_start_matches(|c| c == 'v' || c == 'V')
            .split('.')
            .map(|p| {
                p.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (a, b) = (parts(a), parts(b));
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            a.get(i)
                .copied()
                .unwrap_or(0)
                .cmp(&b.get(i).copied().unwrap_or(0))
        })
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::automate::MockRequestExchanger;

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.10.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("v2.0", "2.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.2.3-beta", "1.2.4"), Ordering::Less);
    }

    #[tokio::test]
    async fn test_fetch_default_tasks_parses_definitions() {
        // Arrange
        let mut mock = MockRequestExchanger::new();
        mock.expect_exchange()
            .withf(|endpoint: &str, _: &Value| endpoint == "get_default_tasks")
            .returning(|_, _| {
                Some(json!({"status": "success", "tasks": [
                    {"id": "daily", "name": "Daily", "variables": [{"name": "stage", "type": "string", "default": "1-7"}]},
                    {"id": "base", "name": "Base"}
                ]}))
            });

        // Act
        let tasks = fetch_default_tasks(&mock).await.unwrap();

        // Assert
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].variables[0].name, "stage");
    }

    #[tokio::test]
    async fn test_fetch_default_tasks_errors() {
        let mut missing = MockRequestExchanger::new();
        missing
            .expect_exchange()
            .returning(|_, _| Some(json!({"status": "success"})));
        let mut silent = MockRequestExchanger::new();
        silent.expect_exchange().returning(|_, _| None);

        assert!(matches!(
            fetch_default_tasks(&missing).await,
            Err(CatalogError::Unexpected { field: "tasks", .. })
        ));
        assert!(matches!(
            fetch_default_tasks(&silent).await,
            Err(CatalogError::NoResponse)
        ));
    }

    #[tokio::test]
    async fn test_check_version_reports_update() {
        let mut mock = MockRequestExchanger::new();
        mock.expect_exchange()
            .returning(|_, _| Some(json!({"status": "success", "data": {"latest_version": "0.3.0"}})));

        let status = check_version(&mock, "0.2.5").await.unwrap();

        assert!(status.update_available);
        assert_eq!(status.latest, "0.3.0");
    }
}
