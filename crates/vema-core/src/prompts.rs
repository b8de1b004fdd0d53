//! Prompt bundle: the agent system prompt and the synthesis prompt.
//! Shipped with built-in defaults; overridable through a TOML file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VemaError};

const SYSTEM_PROMPT: &str = "你是机动车排放计算助手，可以调用工具完成排放因子查询、\
微观（逐秒轨迹）排放计算、宏观（路段）排放计算、文件结构分析和知识检索。\n\
\n\
## 原则\n\
1. 信任工具：参数直接传用户原话（如“小汽车”“氮氧”），系统会自动识别标准名称。\n\
2. 上传文件时，文件上下文的 task_type 字段指明任务类型：micro_emission 用 \
calculate_micro_emission，macro_emission 用 calculate_macro_emission。\n\
3. 缺少关键参数时直接向用户追问，不要编造。\n\
4. 不调用工具也能回答的问题（问候、闲聊）直接回答。";

/// Synthesis prompt; `{results}` is replaced with filtered tool results JSON.
const SYNTHESIS_PROMPT: &str = "你是机动车排放计算助手。基于工具执行结果生成专业回答。\n\
\n\
## 要求\n\
1. 只使用工具返回的实际数据，不要编造或推算数值\n\
2. 总结关键结果（总排放量、计算参数、统计信息）\n\
3. query_knowledge 工具：完整保留返回的答案和参考文档\n\
4. 其他工具：不要添加“参考文档”字样\n\
5. 失败时说明问题并给出建议\n\
\n\
## 工具执行结果\n\
{results}\n\
\n\
请生成简洁专业的回答。";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompts {
    pub system_prompt: String,
    pub synthesis_prompt: String,
}

impl Prompts {
    pub fn builtin() -> Self {
        Self {
            system_prompt: SYSTEM_PROMPT.to_string(),
            synthesis_prompt: SYNTHESIS_PROMPT.to_string(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| VemaError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| VemaError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Render the synthesis prompt with the filtered tool-results JSON.
    pub fn render_synthesis(&self, results_json: &str) -> String {
        self.synthesis_prompt.replace("{results}", results_json)
    }
}
