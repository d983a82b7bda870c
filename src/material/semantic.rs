//! Well-known shader semantics
//!
//! Material parameters may be bound to a [`Semantic`] instead of carrying
//! their own value. The pipeline writes camera, light and global texture
//! state into [`MaterialSemantics`] and bound parameters pick it up when a
//! pass is bound for drawing.

use super::variant::{MaterialVariant, VariantAssign};

macro_rules! semantics {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Well-known uniform names shared by every material
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Semantic {
            $($variant),*
        }

        impl Semantic {
            pub const ALL: &'static [Semantic] = &[$(Semantic::$variant),*];

            /// Name shaders use to refer to this semantic.
            pub fn name(&self) -> &'static str {
                match self {
                    $(Semantic::$variant => $name),*
                }
            }
        }
    };
}

semantics! {
    View => "View",
    Projection => "Projection",
    ViewProjection => "ViewProjection",
    InverseView => "InverseView",
    InverseProjection => "InverseProjection",
    InverseViewProjection => "InverseViewProjection",
    CameraPosition => "CameraPosition",
    CameraNearFar => "CameraNearFar",
    ViewportSize => "ViewportSize",
    Time => "Time",
    World => "World",
    WorldViewProjection => "WorldViewProjection",
    LightColor => "LightColor",
    LightDirection => "LightDirection",
    LightPosition => "LightPosition",
    LightRange => "LightRange",
    LightSpotCone => "LightSpotCone",
    ShadowMatrix => "ShadowMatrix",
    ShadowMap => "ShadowMap",
    GBufferDepth => "GBufferDepth",
    GBufferAlbedo => "GBufferAlbedo",
    GBufferNormal => "GBufferNormal",
    LinearDepth => "LinearDepth",
    LightingBuffer => "LightingBuffer",
    ShadingBuffer => "ShadingBuffer",
    ProbeColor => "ProbeColor",
    ProbeNormal => "ProbeNormal",
    PostSource => "PostSource",
}

impl Semantic {
    /// Look up a semantic by its well-known name.
    pub fn from_name(name: &str) -> Option<Semantic> {
        Self::ALL.iter().copied().find(|s| s.name() == name)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Registry of the current value of every semantic
#[derive(Debug, Clone)]
pub struct MaterialSemantics {
    values: Vec<MaterialVariant>,
}

impl Default for MaterialSemantics {
    fn default() -> Self {
        Self::new()
    }
}

impl MaterialSemantics {
    pub fn new() -> Self {
        Self {
            values: vec![MaterialVariant::new(); Semantic::ALL.len()],
        }
    }

    pub fn set<T: VariantAssign>(&mut self, semantic: Semantic, value: T) {
        self.values[semantic.index()].assign(value);
    }

    pub fn get(&self, semantic: Semantic) -> &MaterialVariant {
        &self.values[semantic.index()]
    }

    /// Value for a semantic given by name.
    pub fn lookup(&self, name: &str) -> Option<&MaterialVariant> {
        Semantic::from_name(name).map(|s| self.get(s))
    }

    /// Reset a semantic to hold nothing.
    pub fn clear(&mut self, semantic: Semantic) {
        self.values[semantic.index()] = MaterialVariant::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat4, Vec3};

    #[test]
    fn test_names_round_trip() {
        for semantic in Semantic::ALL {
            assert_eq!(Semantic::from_name(semantic.name()), Some(*semantic));
        }
        assert_eq!(Semantic::from_name("NotASemantic"), None);
    }

    #[test]
    fn test_set_and_lookup() {
        let mut semantics = MaterialSemantics::new();
        semantics.set(Semantic::ViewProjection, Mat4::IDENTITY);
        semantics.set(Semantic::LightColor, Vec3::new(1.0, 0.5, 0.0));

        assert_eq!(
            semantics.lookup("ViewProjection").map(|v| *v.get_float4x4()),
            Some(Mat4::IDENTITY)
        );
        assert_eq!(
            semantics.get(Semantic::LightColor).get_float3(),
            Vec3::new(1.0, 0.5, 0.0)
        );

        semantics.clear(Semantic::LightColor);
        assert!(semantics.get(Semantic::LightColor).is_none());
    }
}
