pub mod toml_loader;

pub use toml_loader::{load_all_scenario_banks, load_scenario_bank};
