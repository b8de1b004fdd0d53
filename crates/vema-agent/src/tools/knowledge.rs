//! Tool: query_knowledge. Retrieval + rerank + grounded answer.
//!
//! The refiner LLM is instructed not to produce a reference section; whatever
//! it returns is stripped of any such section anyway, and the deduplicated
//! numbered 参考文档 block is appended deterministically from the retrieved
//! sources. The summary IS the full answer; the router returns it verbatim.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use vema_calc::{KnowledgeChunk, Retriever};
use vema_llm::ChatProvider;

use super::{Tool, ToolResult};

const DEFAULT_TOP_K: usize = 5;
/// Chunks handed to the refiner as context.
const REFINE_CONTEXT_CHUNKS: usize = 3;

pub struct KnowledgeTool {
    retriever: Arc<dyn Retriever>,
    refiner: Arc<dyn ChatProvider>,
}

impl KnowledgeTool {
    pub fn new(retriever: Arc<dyn Retriever>, refiner: Arc<dyn ChatProvider>) -> Self {
        Self { retriever, refiner }
    }

    async fn refine_answer(
        &self,
        query: &str,
        results: &[KnowledgeChunk],
        expectation: Option<&str>,
    ) -> String {
        let context = results
            .iter()
            .take(REFINE_CONTEXT_CHUNKS)
            .enumerate()
            .map(|(i, r)| format!("[来源{}]\n{}", i + 1, r.content))
            .collect::<Vec<_>>()
            .join("\n\n");

        let expectation_line = expectation
            .map(|e| format!("**期望信息**: {e}\n"))
            .unwrap_or_default();

        let prompt = format!(
            "请根据以下检索结果，回答用户问题。\n\n\
             **用户问题**: {query}\n\n\
             **检索结果**:\n{context}\n\n\
             {expectation_line}\
             ## 回答要求\n\n\
             1. 使用 Markdown 格式，### 作为章节标题，**加粗** 强调关键词\n\
             2. 开头用 1-2 句话概述核心答案，按主题分 2-4 个章节\n\
             3. 陈述事实时用 [来源1]、[来源2] 标注来源\n\
             4. 不要在末尾添加“参考文档”或“参考来源”部分（系统会自动添加）\n\
             5. 专业但通俗易懂；信息不完整时诚实说明\n\n\
             请生成回答："
        );

        let messages = vec![serde_json::json!({"role": "user", "content": prompt})];
        match self.refiner.chat(&messages, None).await {
            Ok(resp) => resp.content,
            Err(e) => {
                warn!(error = %e, "answer refinement failed, falling back to extract");
                let mut lines = vec![format!("检索到{}条相关信息：", results.len())];
                for r in results.iter().take(REFINE_CONTEXT_CHUNKS) {
                    let excerpt: String = r.content.chars().take(100).collect();
                    lines.push(format!("- {excerpt}..."));
                }
                lines.join("\n")
            }
        }
    }
}

#[async_trait]
impl Tool for KnowledgeTool {
    fn name(&self) -> &str {
        "query_knowledge"
    }

    fn description(&self) -> &str {
        "Search emission knowledge base for standards, regulations, and technical concepts."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The question or topic to search for in the knowledge base"
                },
                "top_k": {
                    "type": "integer",
                    "description": "Number of knowledge entries to retrieve. Optional, defaults to 5."
                },
                "expectation": {
                    "type": "string",
                    "description": "Expected type of information (e.g., 'standard definition', 'regulation details'). Optional."
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value) -> ToolResult {
        let query = match params.get("query").and_then(Value::as_str) {
            Some(q) if !q.trim().is_empty() => q.to_string(),
            _ => return ToolResult::missing_params(&["query"]),
        };
        let top_k = params
            .get("top_k")
            .and_then(Value::as_u64)
            .map(|k| k as usize)
            .unwrap_or(DEFAULT_TOP_K);
        let expectation = params
            .get("expectation")
            .and_then(Value::as_str)
            .map(str::to_string);

        let results = match self.retriever.search(&query, top_k).await {
            Ok(r) => r,
            Err(e) => return ToolResult::error(e.to_string()),
        };

        if results.is_empty() {
            let answer = "未找到相关知识，请尝试其他问法。".to_string();
            return ToolResult::success(
                serde_json::json!({ "query": query, "results": [], "answer": answer.clone() }),
                answer,
            );
        }

        info!(initial = results.len(), "knowledge retrieval complete");
        let reranked = match self.retriever.rerank(&query, results, top_k).await {
            Ok(r) => r,
            Err(e) => return ToolResult::error(e.to_string()),
        };

        let refined = self
            .refine_answer(&query, &reranked, expectation.as_deref())
            .await;
        let mut answer = strip_reference_section(&refined);

        let sources = deduplicate_sources(
            reranked
                .iter()
                .map(|r| r.source.as_str())
                .filter(|s| !s.is_empty()),
        );

        if !sources.is_empty() {
            let list = sources
                .iter()
                .enumerate()
                .map(|(i, s)| format!("{}. {s}", i + 1))
                .collect::<Vec<_>>()
                .join("\n");
            answer = format!("{answer}\n\n**参考文档**：\n{list}");
        }

        let data = serde_json::json!({
            "query": query,
            "results": reranked,
            "answer": answer.clone(),
            "sources": sources,
        });

        ToolResult::success(data, answer)
    }
}

/// Drop any reference section the model produced despite instructions; the
/// deterministic block below is the only one that may appear.
fn strip_reference_section(answer: &str) -> String {
    const MARKERS: [&str; 4] = ["**参考文档**", "参考文档：", "**参考来源**", "参考来源："];
    let mut cut = answer.len();
    for marker in MARKERS {
        if let Some(pos) = answer.find(marker) {
            cut = cut.min(pos);
        }
    }
    answer[..cut].trim_end().to_string()
}

/// Deduplicate sources by whitespace-normalized name, preserving order.
fn deduplicate_sources<'a>(sources: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::new();
    for source in sources {
        let normalized: String = source.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.is_empty() {
            continue;
        }
        if seen.insert(normalized) {
            unique.push(source.to_string());
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_sections_are_stripped() {
        let answer = "国六标准是……\n\n**参考文档**：\n1. 某文档";
        assert_eq!(strip_reference_section(answer), "国六标准是……");

        let answer2 = "正文\n\n参考来源：x";
        assert_eq!(strip_reference_section(answer2), "正文");

        let clean = "没有参考部分的正文";
        assert_eq!(strip_reference_section(clean), clean);
    }

    #[test]
    fn sources_deduplicate_and_preserve_order() {
        let sources = vec!["《文档A》", "《文档 A》", "《文档B》", "《文档A》"];
        // Whitespace-normalized names collapse, order of first sight wins.
        let unique = deduplicate_sources(sources.into_iter());
        assert_eq!(unique.len(), 3);
        assert_eq!(unique[0], "《文档A》");
        assert_eq!(unique[1], "《文档 A》");
    }
}
