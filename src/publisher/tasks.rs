//! Generation tasks that drive the invoker and publish what it returns.

use super::{BoxFut, GenerationTask, TaskContext};
use crate::artifact::{ArtifactDraft, ArtifactKind};
use crate::error::Result;
use crate::invoker::InvocationRequest;
use crate::structured::{parse_file_set, FileSet};
use futures::StreamExt;
use serde_json::json;

/// Streams one artifact, publishing a draft version every `draft_every`
/// tokens and the finished text at the end.
///
/// If the stream breaks, whatever arrived is kept as a draft and the error
/// is returned, so the session shows a failed status next to the partial
/// content.
#[derive(Debug, Clone)]
pub struct DraftTask {
    name: String,
    path: String,
    kind: ArtifactKind,
    request: InvocationRequest,
    draft_every: usize,
}

impl DraftTask {
    pub fn new(path: impl Into<String>, kind: ArtifactKind, request: InvocationRequest) -> Self {
        let path = path.into();
        Self {
            name: format!("draft {path}"),
            path,
            kind,
            request: request.streaming(true),
            draft_every: 32,
        }
    }

    /// Tokens between draft versions. `0` disables intermediate drafts.
    pub fn draft_every(mut self, tokens: usize) -> Self {
        self.draft_every = tokens;
        self
    }

    fn draft(&self, text: &str) -> ArtifactDraft {
        ArtifactDraft::content(self.path.clone(), self.kind, text)
    }

    async fn execute(self, ctx: TaskContext) -> Result<()> {
        let mut stream = ctx.invoker().invoke_stream(&self.request).await?;
        ctx.status(format!(
            "Writing {} with {}/{}",
            self.path, stream.provider, stream.model
        ));

        let mut text = String::new();
        let mut since_draft = 0;
        while let Some(item) = stream.tokens.next().await {
            match item {
                Ok(token) => {
                    text.push_str(&token);
                    since_draft += 1;
                    if self.draft_every > 0 && since_draft >= self.draft_every {
                        ctx.publish(self.draft(&text))?;
                        since_draft = 0;
                    }
                }
                Err(e) => {
                    if !text.is_empty() {
                        ctx.publish(self.draft(&text).with_summary("partial"))?;
                    }
                    return Err(e);
                }
            }
        }

        let summary = format!("generated by {}/{}", stream.provider, stream.model);
        ctx.publish(self.draft(&text).with_summary(summary))?;
        Ok(())
    }
}

impl GenerationTask for DraftTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(self: Box<Self>, ctx: TaskContext) -> BoxFut<'static, Result<()>> {
        Box::pin(self.execute(ctx))
    }
}

/// Asks for a JSON file set in one blocking call and publishes every file,
/// followed by a bundle manifest listing them.
///
/// An answer that cannot be parsed is published as a single summary
/// artifact instead of failing the task.
#[derive(Debug, Clone)]
pub struct FileSetTask {
    name: String,
    request: InvocationRequest,
    bundle_path: String,
}

impl FileSetTask {
    pub fn new(request: InvocationRequest) -> Self {
        let mut request = request.streaming(false);
        request.options.json_mode = true;
        Self {
            name: "file set".to_string(),
            request,
            bundle_path: "bundle.json".to_string(),
        }
    }

    pub fn with_bundle_path(mut self, path: impl Into<String>) -> Self {
        self.bundle_path = path.into();
        self
    }

    async fn execute(self, ctx: TaskContext) -> Result<()> {
        let answer = ctx.invoker().invoke(&self.request).await?;
        let set = parse_file_set(&answer.text).unwrap_or_else(|e| {
            tracing::warn!(error = %e, provider = %answer.provider, "unreadable file set, keeping raw text");
            FileSet::fallback(&answer.text)
        });

        if set.is_fallback {
            for file in set.files {
                let kind = file.kind();
                ctx.publish(
                    ArtifactDraft::content(file.path, kind, file.content).with_summary(&set.summary),
                )?;
            }
            return Ok(());
        }

        ctx.status(format!("Publishing {} files", set.files.len()));
        let mut manifest = Vec::with_capacity(set.files.len());
        for file in set.files {
            let kind = file.kind();
            let outcome = ctx.publish(
                ArtifactDraft::content(file.path, kind, file.content)
                    .with_requirements(file.requirement_refs),
            )?;
            let stored = outcome.version();
            manifest.push(json!({
                "path": stored.path,
                "kind": stored.kind,
                "version": stored.version,
            }));
        }

        let bundle = json!({
            "summary": set.summary,
            "provider": answer.provider,
            "model": answer.model,
            "files": manifest,
        });
        ctx.publish(
            ArtifactDraft::content(
                self.bundle_path.clone(),
                ArtifactKind::Bundle,
                serde_json::to_string_pretty(&bundle)?,
            )
            .with_summary(set.summary),
        )?;
        Ok(())
    }
}

impl GenerationTask for FileSetTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(self: Box<Self>, ctx: TaskContext) -> BoxFut<'static, Result<()>> {
        Box::pin(self.execute(ctx))
    }
}
