use indexmap::IndexMap;

pub const DEFAULT_DIRECTIVE: &str = "socratic";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveSpec {
    pub name: String,
    pub instruction: String,
}

#[derive(Debug, Clone)]
pub struct DirectiveRegistry {
    directives: IndexMap<String, DirectiveSpec>,
    default_name: String,
}

impl DirectiveRegistry {
    pub fn new(directives: Option<IndexMap<String, DirectiveSpec>>) -> Self {
        let directives = directives.unwrap_or_else(builtin_directives);
        let default_name = if directives.contains_key(DEFAULT_DIRECTIVE) {
            DEFAULT_DIRECTIVE.to_string()
        } else {
            directives.keys().next().cloned().unwrap_or_default()
        };
        Self {
            directives,
            default_name,
        }
    }

    pub fn get(&self, name: &str) -> Option<&DirectiveSpec> {
        self.directives.get(name.trim())
    }

    pub fn names(&self) -> Vec<String> {
        self.directives.keys().cloned().collect()
    }

    pub fn default_directive(&self) -> Option<&DirectiveSpec> {
        self.directives.get(&self.default_name)
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    /// Makes `name` the default. Unknown names are ignored and reported.
    pub fn set_default(&mut self, name: &str) -> bool {
        let name = name.trim();
        if !self.directives.contains_key(name) {
            return false;
        }
        self.default_name = name.to_string();
        true
    }

    /// Replaces (or adds) a directive's instruction text.
    pub fn override_instruction(&mut self, name: &str, instruction: impl Into<String>) {
        let name = name.trim().to_string();
        self.directives.insert(
            name.clone(),
            DirectiveSpec {
                name,
                instruction: instruction.into(),
            },
        );
    }
}

impl Default for DirectiveRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

fn builtin_directives() -> IndexMap<String, DirectiveSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, instruction: &str| {
        map.insert(
            name.to_string(),
            DirectiveSpec {
                name: name.to_string(),
                instruction: instruction.to_string(),
            },
        );
    };

    insert(
        "socratic",
        "You are a patient tutor looking at the same problem image as the student. \
Guide the student toward the answer with questions and hints; never state the final answer or \
a full worked solution. If the student proposes an answer, say whether it is correct and, if \
not, point at the step to revisit. Keep replies short and encouraging.",
    );
    insert(
        "hint-ladder",
        "You are a tutor working from the problem shown in the image. Reply with exactly one hint \
per message, each slightly more specific than the last one in the conversation. Do not reveal \
the final answer even if asked directly; confirm it only once the student states it.",
    );
    insert(
        "check-work",
        "You are a tutor reviewing the student's reasoning about the problem in the image. Point \
out the first incorrect step, if any, and ask a question that helps the student fix it. Never \
rewrite the solution for them.",
    );

    map
}
