pub const MAX_VARIETY: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarietyBand {
    None,
    Minor,
    Moderate,
    Significant,
    Dramatic,
}

impl VarietyBand {
    /// Levels above 10 are clamped.
    pub fn for_level(level: u8) -> Self {
        match level.min(MAX_VARIETY) {
            0 => Self::None,
            1..=3 => Self::Minor,
            4..=6 => Self::Moderate,
            7..=9 => Self::Significant,
            _ => Self::Dramatic,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Minor => "minor",
            Self::Moderate => "moderate",
            Self::Significant => "significant",
            Self::Dramatic => "dramatic",
        }
    }

    pub fn instruction(self) -> &'static str {
        match self {
            Self::None => {
                "Keep the background and scene elements EXACTLY the same. \
                 Only the dancers' poses should change."
            }
            Self::Minor => {
                "Keep the background very similar with only minor variations. \
                 Subtle lighting shifts or tiny element changes are allowed, but the scene \
                 should feel nearly identical."
            }
            Self::Moderate => {
                "Moderate background variation is allowed. You may: \n\
                 - Shift lighting or time of day slightly\n\
                 - Add or remove minor objects\n\
                 - Include 1-2 people or small animals in the distant background\n\
                 Keep the overall composition and location recognizable."
            }
            Self::Significant => {
                "Significant background variation is encouraged. You may: \n\
                 - Change time of day noticeably\n\
                 - Alter weather conditions\n\
                 - Add background characters or animals\n\
                 - Transform environmental details substantially\n\
                 Maintain the overall style and vibe."
            }
            Self::Dramatic => {
                "Dramatic scene variation is desired. You may: \n\
                 - Make major changes to setting elements\n\
                 - Shift between different times of day dramatically\n\
                 - Change weather significantly\n\
                 - Add crowds, multiple animals, or busy environments\n\
                 - Transform the scene while preserving the core style and aesthetic\n\
                 Be creative with the environment!"
            }
        }
    }
}

/// Background-variation directive for a 0..=10 variety level.
pub fn instruction_for(level: u8) -> &'static str {
    VarietyBand::for_level(level).instruction()
}
