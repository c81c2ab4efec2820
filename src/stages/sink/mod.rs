mod final_stage;

pub use final_stage::FinalStage;
