pub mod state;

pub use state::{
    EDITABLE_FIELDS, PlaygroundSettings, SAMPLE_BASE_URL, SettingsError, SettingsOverrides,
    SettingsStore,
};
