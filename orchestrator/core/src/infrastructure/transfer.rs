// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local filesystem transfer executor.
//!
//! Stages input files into a unit sandbox that is reachable as a local path
//! (a shared filesystem, or a pilot running on the same host).

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::domain::transfer::{TransferError, TransferExecutor, TransferRequest, TransferResult};

#[derive(Debug, Clone, Default)]
pub struct LocalFileTransferExecutor {
    /// Relative `input_data` entries are resolved against this directory.
    base_dir: Option<PathBuf>,
}

impl LocalFileTransferExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, entry: &str) -> PathBuf {
        let path = Path::new(entry.strip_prefix("file://").unwrap_or(entry));
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[async_trait]
impl TransferExecutor for LocalFileTransferExecutor {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferResult, TransferError> {
        let sandbox = PathBuf::from(&request.unit_sandbox);
        tokio::fs::create_dir_all(&sandbox).await?;

        let mut log = Vec::with_capacity(request.input_data.len());
        for entry in &request.input_data {
            let source = self.resolve(entry);
            let file_name = source
                .file_name()
                .ok_or_else(|| TransferError::Rejected(format!("not a file path: {}", entry)))?;
            if !tokio::fs::try_exists(&source).await? {
                return Err(TransferError::SourceNotFound(source.display().to_string()));
            }

            let target = sandbox.join(file_name);
            let bytes = tokio::fs::copy(&source, &target).await?;
            debug!(
                unit_id = %request.unit_uid,
                source = %source.display(),
                target = %target.display(),
                bytes,
                "Staged input file"
            );
            log.push(format!("staged {} -> {}", source.display(), target.display()));
        }

        Ok(TransferResult::succeeded(request, log))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transfer::Credentials;
    use crate::domain::unit::{PilotId, UnitId, UnitState};

    fn request(sandbox: &Path, input_data: Vec<String>) -> TransferRequest {
        TransferRequest {
            pilot_uid: PilotId::from("P1"),
            unit_uid: UnitId::from("U1"),
            credentials: Credentials::new(),
            unit_sandbox: sandbox.display().to_string(),
            input_data,
        }
    }

    #[tokio::test]
    async fn test_stages_relative_inputs_into_sandbox() {
        let inputs = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        std::fs::write(inputs.path().join("a.txt"), b"alpha").unwrap();

        let executor = LocalFileTransferExecutor::with_base_dir(inputs.path());
        let sandbox = remote.path().join("P1").join("U1");
        let result = executor
            .transfer(&request(&sandbox, vec!["a.txt".to_string()]))
            .await
            .unwrap();

        assert_eq!(result.state, UnitState::PendingExecution);
        assert_eq!(result.log.len(), 1);
        assert_eq!(std::fs::read(sandbox.join("a.txt")).unwrap(), b"alpha");
    }

    #[tokio::test]
    async fn test_missing_input_is_an_error() {
        let remote = tempfile::tempdir().unwrap();
        let executor = LocalFileTransferExecutor::new();

        let err = executor
            .transfer(&request(remote.path(), vec!["/definitely/not/here.dat".to_string()]))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::SourceNotFound(_)));
    }
}
