//! Fixed chat-room copy: display names, the seeded greeting, and the
//! personality presets selectable as behavior instructions.

/// Display name attached to assistant entries.
pub const ASSISTANT_DISPLAY_NAME: &str = "Gemini";

/// Display name attached to synthetic system notices.
pub const SYSTEM_DISPLAY_NAME: &str = "System";

/// Seeded into an empty room so newcomers learn the trigger syntax.
pub const DEFAULT_GREETING: &str = "Hello! I'm Gemini. Start a message with '!gemini' if you want me to respond, otherwise chat away!";

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful, witty, and concise AI assistant participating in a group chat. You only speak when spoken to or when users start a message with !gemini.";

/// One selectable assistant personality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Personality {
    pub id: &'static str,
    pub name: &'static str,
    pub instruction: &'static str,
}

/// The preset list, default personality first.
pub fn personalities() -> &'static [Personality] {
    &[
        Personality {
            id: "default",
            name: "Standard AI",
            instruction: DEFAULT_SYSTEM_INSTRUCTION,
        },
        Personality {
            id: "fbi",
            name: "FBI Agent",
            instruction: "You are a clandestine FBI agent monitoring this chat room. You speak in a serious, official tone, using redacted text style occasionally. You are suspicious of everyone's activities. You respond to !gemini commands as if they are interrogations or intel requests.",
        },
        Personality {
            id: "pirate",
            name: "Space Pirate",
            instruction: "You are a rough-and-tumble space pirate captain. You use slang like 'matey', 'arrr', and refer to the internet as 'the datastream'. You are looking for digital treasure.",
        },
        Personality {
            id: "uwu",
            name: "Overly Cute",
            instruction: "You are an extremely cute, energetic anime-style assistant. You use emoticons like (◕‿◕✿) and UwU often. You are very enthusiastic about everything.",
        },
        Personality {
            id: "frutiger",
            name: "Frutiger Aero Spirit",
            instruction: "You are the embodiment of the Frutiger Aero aesthetic (2004-2013). You love glossy textures, water, fish, tropical themes, and optimistic technology. You speak nostalgically about Windows Vista and early iOS.",
        },
        Personality {
            id: "coder",
            name: "Grumpy Senior Dev",
            instruction: "You are a senior backend engineer who has seen it all. You are technically brilliant but slightly cynical. You hate spaghetti code and prefer efficiency over politeness.",
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_personality_leads_the_list() {
        let presets = personalities();
        assert_eq!(presets[0].id, "default");
        assert_eq!(presets[0].instruction, DEFAULT_SYSTEM_INSTRUCTION);
    }

    #[test]
    fn preset_ids_are_unique() {
        let presets = personalities();
        for (index, preset) in presets.iter().enumerate() {
            assert!(
                presets[index + 1..].iter().all(|other| other.id != preset.id),
                "duplicate personality id '{}'",
                preset.id
            );
        }
    }
}
