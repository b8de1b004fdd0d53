use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use vema_calc::{
    AverageSpeedLinkCalculator, ParametricFactorSource, StaticRetriever, VspTrajectoryCalculator,
};
use vema_core::config::{Limits, StandardizerConfig};
use vema_core::mappings::Mappings;
use vema_core::prompts::Prompts;
use vema_llm::{ChatProvider, LlmError, LlmResponse, ToolCall};
use vema_memory::SessionMemory;
use vema_standardizer::Standardizer;

use crate::assembler::ContextAssembler;
use crate::executor::ToolExecutor;
use crate::tools::{
    factors::EmissionFactorsTool, file_analyzer::FileAnalyzerTool, knowledge::KnowledgeTool,
    macro_emission::MacroEmissionTool, micro_emission::MicroEmissionTool, ToolRegistry,
};

use super::Router;

/// Scripted provider: pops one canned response per chat_with_tools call;
/// plain chat always answers with `chat_text`.
struct ScriptedProvider {
    responses: Mutex<VecDeque<LlmResponse>>,
    chat_text: String,
    tool_calls_made: Mutex<u32>,
}

impl ScriptedProvider {
    fn new(responses: Vec<LlmResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            chat_text: "综合结果如下。".to_string(),
            tool_calls_made: Mutex::new(0),
        })
    }

    fn with_chat_text(responses: Vec<LlmResponse>, chat_text: &str) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            chat_text: chat_text.to_string(),
            tool_calls_made: Mutex::new(0),
        })
    }

    fn calls(&self) -> u32 {
        *self.tool_calls_made.lock().unwrap()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat(&self, _: &[Value], _: Option<&str>) -> Result<LlmResponse, LlmError> {
        Ok(text_response(&self.chat_text))
    }

    async fn chat_with_tools(
        &self,
        _: &[Value],
        _: &[Value],
        _: Option<&str>,
    ) -> Result<LlmResponse, LlmError> {
        *self.tool_calls_made.lock().unwrap() += 1;
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| text_response("（无更多脚本回复）")))
    }
}

fn text_response(text: &str) -> LlmResponse {
    LlmResponse {
        content: text.to_string(),
        tool_calls: Vec::new(),
        finish_reason: "stop".to_string(),
    }
}

fn tool_response(name: &str, arguments: Value) -> LlmResponse {
    LlmResponse {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: "call-1".to_string(),
            name: name.to_string(),
            arguments,
        }],
        finish_reason: "tool_calls".to_string(),
    }
}

fn build_router(dir: &Path, agent: Arc<ScriptedProvider>) -> Router {
    let mappings = Arc::new(Mappings::builtin());
    let standardizer = Arc::new(Standardizer::new(
        mappings.clone(),
        &StandardizerConfig::default(),
    ));
    let factors = Arc::new(ParametricFactorSource);
    let outputs = dir.join("outputs");

    let refiner = ScriptedProvider::with_chat_text(vec![], "国六排放标准是中国第六阶段机动车排放标准。[来源1]");

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(EmissionFactorsTool::new(factors.clone())));
    registry.register(Arc::new(MicroEmissionTool::new(
        Arc::new(VspTrajectoryCalculator::new(factors.clone())),
        standardizer.clone(),
        outputs.clone(),
    )));
    registry.register(Arc::new(MacroEmissionTool::new(
        Arc::new(AverageSpeedLinkCalculator::new(factors.clone())),
        standardizer.clone(),
        outputs,
    )));
    registry.register(Arc::new(FileAnalyzerTool::new(standardizer.clone())));
    registry.register(Arc::new(KnowledgeTool::new(
        Arc::new(StaticRetriever::new()),
        refiner,
    )));

    let registry = Arc::new(registry);
    let executor = Arc::new(ToolExecutor::new(registry.clone(), standardizer));
    let prompts = Arc::new(Prompts::builtin());
    let limits = Limits::default();
    let assembler = ContextAssembler::new(&prompts, registry.definitions(), limits.max_context_tokens);
    let memory = SessionMemory::load(
        &dir.join("history"),
        "test-session",
        limits.working_memory_turns,
        limits.assistant_excerpt_chars,
    );

    let synthesis = ScriptedProvider::new(vec![]);
    Router::new(assembler, executor, agent, synthesis, prompts, memory, &limits)
}

#[tokio::test]
async fn direct_response_passes_through() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedProvider::new(vec![text_response("你好！有什么可以帮忙的？")]);
    let mut router = build_router(dir.path(), agent);

    let response = router.chat("你好", None).await.unwrap();
    assert_eq!(response.text, "你好！有什么可以帮忙的？");
    assert!(response.chart_data.is_none());
    assert!(response.table_data.is_none());
    assert_eq!(router.memory().working_memory().len(), 1);
}

#[tokio::test]
async fn vehicle_guard_blocks_micro_without_mention() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedProvider::new(vec![tool_response(
        "calculate_micro_emission",
        serde_json::json!({
            "vehicle_type": "Passenger Car",
            "trajectory_data": [{"t": 0, "speed_kph": 30}],
        }),
    )]);
    let mut router = build_router(dir.path(), agent.clone());

    let response = router.chat("计算一下", None).await.unwrap();
    assert!(response.text.contains("请先告诉我车辆类型"));
    assert!(response.download_file.is_none());
    // The guard fired before any retry round.
    assert_eq!(agent.calls(), 1);
}

#[tokio::test]
async fn vehicle_mention_lets_micro_run() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedProvider::new(vec![tool_response(
        "calculate_micro_emission",
        serde_json::json!({
            "vehicle_type": "小汽车",
            "trajectory_data": [
                {"t": 0, "speed_kph": 30},
                {"t": 1, "speed_kph": 35},
                {"t": 2, "speed_kph": 40},
            ],
        }),
    )]);
    let mut router = build_router(dir.path(), agent);

    let response = router.chat("用小汽车算一下", None).await.unwrap();
    assert!(response.text.contains("微观排放计算结果"));
    let table = response.table_data.unwrap();
    assert_eq!(table["type"], "calculate_micro_emission");
}

#[tokio::test]
async fn backref_with_recent_vehicle_passes_guard() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedProvider::new(vec![
        tool_response(
            "query_emission_factors",
            serde_json::json!({"vehicle_type": "小汽车", "pollutants": ["CO2"], "model_year": 2020}),
        ),
        tool_response(
            "calculate_micro_emission",
            serde_json::json!({
                "vehicle_type": "Passenger Car",
                "trajectory_data": [{"t": 0, "speed_kph": 30}],
            }),
        ),
    ]);
    let mut router = build_router(dir.path(), agent);

    router.chat("查2020年小汽车的CO2排放因子", None).await.unwrap();
    let response = router.chat("沿用，轨迹算一下", None).await.unwrap();
    assert!(response.text.contains("微观排放计算结果"));
}

#[tokio::test]
async fn factors_turn_yields_chart_and_preview_table() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedProvider::new(vec![tool_response(
        "query_emission_factors",
        serde_json::json!({"vehicle_type": "网约车", "pollutants": ["CO2"], "model_year": 2020}),
    )]);
    let mut router = build_router(dir.path(), agent);

    let response = router.chat("查询2020年网约车的CO2排放因子", None).await.unwrap();

    assert!(response.text.contains("排放因子查询结果"));
    let chart = response.chart_data.unwrap();
    assert_eq!(chart["type"], "emission_factors");
    assert_eq!(chart["vehicle_type"], "Passenger Car");
    assert!(chart["pollutants"].get("CO2").is_some());

    let table = response.table_data.unwrap();
    let columns: Vec<&str> = table["columns"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(columns.contains(&"速度 (km/h)"));
    assert!(columns.contains(&"CO2 (g/km)"));
    assert!(!table["preview_rows"].as_array().unwrap().is_empty());

    // Canonicalized identifiers land in fact memory.
    assert_eq!(
        router.memory().fact_memory().recent_vehicle.as_deref(),
        Some("Passenger Car")
    );
    assert_eq!(router.memory().fact_memory().recent_year, Some(2020));
}

#[tokio::test]
async fn tool_error_feeds_back_and_model_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedProvider::new(vec![
        tool_response(
            "query_emission_factors",
            serde_json::json!({"vehicle_type": "小汽车", "pollutants": ["XYZ"], "model_year": 2020}),
        ),
        text_response("无法识别污染物 XYZ，支持的污染物包括 CO2、CO、NOx、PM2.5、PM10、THC、SO2。"),
    ]);
    let mut router = build_router(dir.path(), agent.clone());

    let response = router.chat("查询2020年小汽车的XYZ排放因子", None).await.unwrap();
    assert!(response.text.contains("CO2"));
    assert!(response.text.contains("SO2"));
    // One original round plus one retry with error context.
    assert_eq!(agent.calls(), 2);
}

#[tokio::test]
async fn persistent_failures_fall_back_to_deterministic_report() {
    let dir = tempfile::tempdir().unwrap();
    let bogus = || tool_response("no_such_tool", serde_json::json!({}));
    let agent = ScriptedProvider::new(vec![bogus(), bogus(), bogus(), bogus()]);
    let mut router = build_router(dir.path(), agent.clone());

    let response = router.chat("做点什么", None).await.unwrap();
    assert!(response.text.contains("失败"));
    assert!(response.text.contains("no_such_tool"));
    // Initial round + at most MAX-1 retries.
    assert!(agent.calls() <= 3);
}

#[tokio::test]
async fn knowledge_answer_is_returned_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedProvider::new(vec![tool_response(
        "query_knowledge",
        serde_json::json!({"query": "什么是国六排放标准"}),
    )]);
    let mut router = build_router(dir.path(), agent);

    let response = router.chat("什么是国六排放标准", None).await.unwrap();
    assert!(response.text.contains("国六排放标准"));
    assert!(response.text.contains("**参考文档**"));
    assert!(response.chart_data.is_none());
    assert!(response.table_data.is_none());
}

#[tokio::test]
async fn uploaded_file_is_analyzed_and_cached_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("traj.csv");
    std::fs::write(&input, "time,speed_kmh\n0,30\n1,32\n").unwrap();

    let agent = ScriptedProvider::new(vec![
        text_response("文件已收到，请告诉我车辆类型。"),
        text_response("好的。"),
    ]);
    let mut router = build_router(dir.path(), agent);

    router.chat("看看这个文件", Some(&input)).await.unwrap();

    let analysis = router
        .memory()
        .fact_memory()
        .file_analysis
        .clone()
        .expect("analysis cached");
    assert_eq!(analysis["task_type"], "micro_emission");
    assert_eq!(
        analysis["file_path"].as_str().unwrap(),
        input.display().to_string()
    );
    assert!(analysis["file_mtime"].as_i64().is_some());
    assert_eq!(
        router.memory().fact_memory().active_file.as_deref(),
        Some(input.display().to_string().as_str())
    );
}

#[tokio::test]
async fn macro_file_turn_attaches_download() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("links.xlsx_src.csv");
    std::fs::write(
        &input,
        "link_id,length_km,flow_vph,speed_kph,car_pct,bus_pct,truck_pct\n\
         L1,2.5,5000,60,60,30,20\n",
    )
    .unwrap();

    let agent = ScriptedProvider::new(vec![tool_response(
        "calculate_macro_emission",
        serde_json::json!({"pollutants": ["CO2", "NOx"]}),
    )]);
    let mut router = build_router(dir.path(), agent);

    let response = router.chat("算一下CO2和NOx", Some(&input)).await.unwrap();
    assert!(response.text.contains("宏观排放计算结果"));
    let download = response.download_file.expect("download expected");
    assert!(download.filename.ends_with(".xlsx"));
    assert!(Path::new(&download.path).exists());

    let table = response.table_data.unwrap();
    assert_eq!(table["type"], "calculate_macro_emission");
    let columns: Vec<&str> = table["columns"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(columns.contains(&"CO2_kg_h"));
    assert!(columns.contains(&"CO2_g_veh_km"));
}
