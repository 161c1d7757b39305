use arc_swap::ArcSwapOption;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// A configurable assistant character. Every descriptive field is
/// free-form; empty fields are simply left out of the rendered prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub speaking_style: String,
    #[serde(default)]
    pub specialization: String,
    #[serde(default)]
    pub response_style: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub catchphrase: String,
    #[serde(default)]
    pub greeting: String,
    #[serde(default)]
    pub is_default: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Persona {
    /// Render the system-prompt prefix for this character: one section
    /// per non-empty field, bracketed by identity lines.
    pub fn system_prompt(&self) -> String {
        let mut parts = vec![format!("You are the character \"{}\".", self.name)];
        let sections = [
            ("Personality", &self.personality),
            ("Speaking style", &self.speaking_style),
            ("Specialization", &self.specialization),
            ("Response style", &self.response_style),
            ("Background", &self.background),
            ("Catchphrase", &self.catchphrase),
            ("Greeting", &self.greeting),
        ];
        for (label, value) in sections {
            if !value.trim().is_empty() {
                parts.push(format!("{label}: {}", value.trim()));
            }
        }
        parts.push(format!(
            "Stay consistently in character as \"{}\" throughout the conversation.",
            self.name
        ));
        parts.join("\n")
    }
}

/// Fields supplied when creating a persona.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewPersona {
    pub name: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub speaking_style: String,
    #[serde(default)]
    pub specialization: String,
    #[serde(default)]
    pub response_style: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub catchphrase: String,
    #[serde(default)]
    pub greeting: String,
}

/// JSON-file-backed persona catalog with a hot-swappable active entry.
///
/// Corrupt or missing data loads as the built-in default catalog with a
/// warning; persistence problems never crash the assistant.
pub struct PersonaCatalog {
    path: PathBuf,
    personas: Mutex<Vec<Persona>>,
    active: ArcSwapOption<Persona>,
}

impl PersonaCatalog {
    pub fn load_or_default(path: &Path) -> Self {
        let personas = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Vec<Persona>>(&raw) {
                Ok(parsed) if parsed.is_empty() => vec![default_persona()],
                Ok(parsed) => parsed,
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        %error,
                        "persona catalog is malformed, starting from defaults"
                    );
                    vec![default_persona()]
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                vec![default_persona()]
            }
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    %error,
                    "cannot read persona catalog, starting from defaults"
                );
                vec![default_persona()]
            }
        };

        let active = personas
            .iter()
            .find(|p| p.is_default)
            .cloned()
            .map(Arc::new);

        Self {
            path: path.to_path_buf(),
            personas: Mutex::new(personas),
            active: ArcSwapOption::from(active),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Persona>> {
        self.personas.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self, personas: &[Persona]) {
        match serde_json::to_string_pretty(personas) {
            Ok(raw) => {
                if let Err(error) = std::fs::write(&self.path, raw) {
                    tracing::warn!(path = %self.path.display(), %error, "failed to save persona catalog");
                }
            }
            Err(error) => {
                tracing::warn!(%error, "failed to serialize persona catalog");
            }
        }
    }

    pub fn list(&self) -> Vec<Persona> {
        self.lock().clone()
    }

    pub fn get(&self, id: &str) -> Option<Persona> {
        self.lock().iter().find(|p| p.id == id).cloned()
    }

    pub fn create(&self, fields: NewPersona) -> Persona {
        let now = Utc::now().to_rfc3339();
        let persona = Persona {
            id: Uuid::new_v4().to_string(),
            name: fields.name,
            personality: fields.personality,
            speaking_style: fields.speaking_style,
            specialization: fields.specialization,
            response_style: fields.response_style,
            background: fields.background,
            catchphrase: fields.catchphrase,
            greeting: fields.greeting,
            is_default: false,
            created_at: now.clone(),
            updated_at: now,
        };
        let mut personas = self.lock();
        personas.push(persona.clone());
        self.save(&personas);
        tracing::info!(persona_id = %persona.id, name = %persona.name, "created persona");
        persona
    }

    pub fn delete(&self, id: &str) -> bool {
        let mut personas = self.lock();
        let before = personas.len();
        personas.retain(|p| p.id != id);
        let removed = personas.len() < before;
        if removed {
            self.save(&personas);
            if self
                .active
                .load()
                .as_ref()
                .is_some_and(|active| active.id == id)
            {
                self.active.store(None);
            }
        }
        removed
    }

    /// Make `id` the active character; its system prompt becomes the
    /// persona prefix for subsequent generations.
    pub fn activate(&self, id: &str) -> bool {
        let Some(persona) = self.get(id) else {
            return false;
        };
        tracing::info!(persona_id = %id, name = %persona.name, "activated persona");
        self.active.store(Some(Arc::new(persona)));
        true
    }

    pub fn deactivate(&self) {
        self.active.store(None);
    }

    pub fn active(&self) -> Option<Arc<Persona>> {
        self.active.load_full()
    }

    /// The active persona's rendered prefix, if one is active.
    pub fn active_prefix(&self) -> Option<String> {
        self.active().map(|p| p.system_prompt())
    }
}

fn default_persona() -> Persona {
    let now = Utc::now().to_rfc3339();
    Persona {
        id: "default".into(),
        name: "Kotoba".into(),
        personality: "A kind and knowledgeable assistant.".into(),
        speaking_style: "Polite and approachable.".into(),
        specialization: "General questions.".into(),
        response_style: String::new(),
        background: String::new(),
        catchphrase: String::new(),
        greeting: "Hello! I'm Kotoba.".into(),
        is_default: true,
        created_at: now.clone(),
        updated_at: now,
    }
}
