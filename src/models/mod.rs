pub mod evaluation;
pub mod loaders;
pub mod scenario;
pub mod submission;

pub use evaluation::{
    AssessmentReport, CompetencyEvaluation, CompetencyScore, CompletenessRequest,
    CompletenessVerdict, EvaluationOutcome, ReportSource, ThreadEvaluationRequest, ThreadTurn,
    REPORTS_COLLECTION,
};
pub use loaders::{load_all_scenario_banks, load_scenario_bank};
pub use scenario::{ConversationEntry, MediaRef, Scenario, ScenarioId, FOLLOW_UP_ID_OFFSET};
pub use submission::{
    CleanupReport, PartialSubmission, ProgressInfo, SaveOptions, SaveOutcome, SessionRecovery,
    StoredSubmission, DEFAULT_CANDIDATE_NAME, SUBMISSIONS_COLLECTION,
};
