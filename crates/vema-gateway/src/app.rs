use std::path::PathBuf;
use std::sync::Arc;

use vema_agent::assembler::ContextAssembler;
use vema_agent::executor::ToolExecutor;
use vema_agent::router::Router;
use vema_agent::tools::{
    factors::EmissionFactorsTool, file_analyzer::FileAnalyzerTool, knowledge::KnowledgeTool,
    macro_emission::MacroEmissionTool, micro_emission::MicroEmissionTool, ToolRegistry,
};
use vema_calc::{
    AverageSpeedLinkCalculator, ParametricFactorSource, StaticRetriever, VspTrajectoryCalculator,
};
use vema_core::config::VemaConfig;
use vema_core::mappings::Mappings;
use vema_core::prompts::Prompts;
use vema_core::VemaError;
use vema_llm::{ChatProvider, LlmClient, LlmRole};
use vema_memory::SessionMemory;
use vema_sessions::{RouterFactory, SessionRegistry};
use vema_standardizer::{LocalModelClient, Standardizer};

/// Central shared state, passed as Arc<AppState> to all handlers.
pub struct AppState {
    pub config: VemaConfig,
    pub registry: SessionRegistry,
    pub outputs_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

impl AppState {
    /// Wire the full stack from configuration. Any configuration problem is
    /// fatal here, before the server starts listening.
    pub fn from_config(config: VemaConfig) -> Result<Self, VemaError> {
        let mappings = Arc::new(match &config.mappings_path {
            Some(path) => Mappings::load(path)?,
            None => Mappings::builtin(),
        });
        let prompts = Arc::new(match &config.prompts_path {
            Some(path) => Prompts::load(path)?,
            None => Prompts::builtin(),
        });

        let mut standardizer = Standardizer::new(mappings, &config.standardizer);
        if config.standardizer.local_model_enabled {
            if let Some(url) = &config.standardizer.local_model_url {
                standardizer =
                    standardizer.with_fallback(Arc::new(LocalModelClient::new(url.clone())));
            }
        }
        let standardizer = Arc::new(standardizer);

        let agent_llm: Arc<dyn ChatProvider> = Arc::new(
            LlmClient::for_role(&config.llm, LlmRole::Agent)
                .map_err(|e| VemaError::Config(e.to_string()))?,
        );
        let synthesis_llm: Arc<dyn ChatProvider> = Arc::new(
            LlmClient::for_role(&config.llm, LlmRole::Synthesis)
                .map_err(|e| VemaError::Config(e.to_string()))?,
        );
        let refiner_llm: Arc<dyn ChatProvider> = Arc::new(
            LlmClient::for_role(&config.llm, LlmRole::Refiner)
                .map_err(|e| VemaError::Config(e.to_string()))?,
        );

        let outputs_dir = config.data.outputs_dir.clone();
        let tmp_dir = config.data.tmp_dir.clone();
        std::fs::create_dir_all(&outputs_dir)?;
        std::fs::create_dir_all(&tmp_dir)?;

        let factors = Arc::new(ParametricFactorSource);
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EmissionFactorsTool::new(factors.clone())));
        tools.register(Arc::new(MicroEmissionTool::new(
            Arc::new(VspTrajectoryCalculator::new(factors.clone())),
            standardizer.clone(),
            outputs_dir.clone(),
        )));
        tools.register(Arc::new(MacroEmissionTool::new(
            Arc::new(AverageSpeedLinkCalculator::new(factors)),
            standardizer.clone(),
            outputs_dir.clone(),
        )));
        tools.register(Arc::new(FileAnalyzerTool::new(standardizer.clone())));
        tools.register(Arc::new(KnowledgeTool::new(
            Arc::new(StaticRetriever::new()),
            refiner_llm,
        )));
        let tools = Arc::new(tools);

        let executor = Arc::new(ToolExecutor::new(tools.clone(), standardizer));

        let stack = Arc::new(AgentStack {
            prompts,
            tools,
            executor,
            agent_llm,
            synthesis_llm,
            config: config.clone(),
        });

        let registry = SessionRegistry::new(config.data.data_dir.join("sessions"), stack);

        Ok(Self {
            config,
            registry,
            outputs_dir,
            tmp_dir,
        })
    }
}

/// Everything a router needs, shared process-wide. Implements the session
/// layer's factory so each session gets its own router + memory on demand.
pub struct AgentStack {
    prompts: Arc<Prompts>,
    tools: Arc<ToolRegistry>,
    executor: Arc<ToolExecutor>,
    agent_llm: Arc<dyn ChatProvider>,
    synthesis_llm: Arc<dyn ChatProvider>,
    config: VemaConfig,
}

impl RouterFactory for AgentStack {
    fn create_router(&self, user_id: &str, session_id: &str) -> Router {
        let limits = &self.config.limits;
        // Memory lives beside the session history, per user, so sessions with
        // the same id under different users never share state.
        let memory_dir = self
            .config
            .data
            .data_dir
            .join("sessions")
            .join(user_id)
            .join("memory");
        let memory = SessionMemory::load(
            &memory_dir,
            session_id,
            limits.working_memory_turns,
            limits.assistant_excerpt_chars,
        );
        let assembler = ContextAssembler::new(
            &self.prompts,
            self.tools.definitions(),
            limits.max_context_tokens,
        );
        Router::new(
            assembler,
            self.executor.clone(),
            self.agent_llm.clone(),
            self.synthesis_llm.clone(),
            self.prompts.clone(),
            memory,
            limits,
        )
    }
}
