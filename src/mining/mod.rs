//! Proof of work, difficulty retargeting and block assembly

pub mod difficulty;
pub mod pow;
pub mod solver;
pub mod template;

pub use difficulty::DifficultyCalculator;
pub use pow::{check_proof_of_work, SeededHasher, Target};
pub use solver::{solve_block, SolveResult};
pub use template::TemplateBuilder;
