// Retrieval seam for agent prompts
//
// Agents receive preformatted context through AgentContext; where it comes
// from is behind this trait. The default retriever returns nothing, which
// keeps the pipeline fully functional without a document store. Retrieval
// failures are logged and treated as "no context", never as step failures.

use async_trait::async_trait;

use crate::error::Result;

/// Chunks requested per agent prompt unless a caller asks for fewer.
pub const DEFAULT_MAX_CHUNKS: usize = 5;

#[derive(Debug, Clone)]
pub struct ContextChunk {
    pub content: String,
    pub file_name: String,
    pub score: f64,
}

#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve(
        &self,
        project_id: i64,
        query: &str,
        max_chunks: usize,
    ) -> Result<Vec<ContextChunk>>;
}

/// Retriever used when no document store is configured.
pub struct NoRetriever;

#[async_trait]
impl ContextRetriever for NoRetriever {
    async fn retrieve(
        &self,
        _project_id: i64,
        _query: &str,
        _max_chunks: usize,
    ) -> Result<Vec<ContextChunk>> {
        Ok(Vec::new())
    }
}

/// Render retrieved chunks as a prompt section. Empty input renders to an
/// empty string so callers can append unconditionally.
pub fn format_rag_context(chunks: &[ContextChunk]) -> String {
    if chunks.is_empty() {
        return String::new();
    }
    let body = chunks
        .iter()
        .map(|c| format!("[Source: {}]\n{}", c.file_name, c.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "Relevant context from uploaded project documents:\n\n{body}\n\n\
         Use this context to ground your analysis where applicable."
    )
}

/// Fetch and format context for a project, degrading to empty on error.
pub async fn gather_context(
    retriever: &dyn ContextRetriever,
    project_id: i64,
    query: &str,
    max_chunks: usize,
) -> String {
    match retriever.retrieve(project_id, query, max_chunks).await {
        Ok(chunks) => format_rag_context(&chunks),
        Err(e) => {
            tracing::warn!(project_id, error = %e, "context retrieval failed, continuing without");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_context_renders_empty() {
        assert_eq!(format_rag_context(&[]), "");
    }

    #[test]
    fn test_chunks_render_with_sources() {
        let chunks = vec![ContextChunk {
            content: "Revenue fell 12% in Q3.".into(),
            file_name: "q3-report.pdf".into(),
            score: 0.82,
        }];
        let rendered = format_rag_context(&chunks);
        assert!(rendered.contains("[Source: q3-report.pdf]"));
        assert!(rendered.contains("Revenue fell 12%"));
    }

    #[tokio::test]
    async fn test_no_retriever_returns_nothing() {
        let context = gather_context(&NoRetriever, 1, "anything", DEFAULT_MAX_CHUNKS).await;
        assert!(context.is_empty());
    }

    #[tokio::test]
    async fn test_retriever_receives_chunk_budget() {
        struct Capped;

        #[async_trait]
        impl ContextRetriever for Capped {
            async fn retrieve(
                &self,
                _project_id: i64,
                _query: &str,
                max_chunks: usize,
            ) -> Result<Vec<ContextChunk>> {
                let chunks = (0..10)
                    .map(|i| ContextChunk {
                        content: format!("chunk {i}"),
                        file_name: format!("doc-{i}.pdf"),
                        score: 1.0,
                    })
                    .take(max_chunks)
                    .collect();
                Ok(chunks)
            }
        }

        let rendered = gather_context(&Capped, 1, "anything", 2).await;
        assert!(rendered.contains("doc-0.pdf"));
        assert!(rendered.contains("doc-1.pdf"));
        assert!(!rendered.contains("doc-2.pdf"));
    }
}
