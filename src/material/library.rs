//! Material definitions, instances and string-keyed lookup
//!
//! Lookups by name happen once, when a pipeline component is set up; the
//! returned handles are cached and used every frame.

use std::collections::HashMap;

use crate::backend::{DrawCall, Geometry, PassState};
use crate::error::{PipelineError, PipelineResult};
use crate::scene::RenderQueue;

use super::semantic::{MaterialSemantics, Semantic};
use super::variant::{MaterialVariant, VariantAssign, VariantType};

/// Globally unique identity of a material pass, stable for the library's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassId(pub(crate) u32);

/// Handle to a material instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialHandle(pub(crate) u32);

/// Cached handle to one parameter of a material instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParameterHandle {
    material: MaterialHandle,
    index: u32,
}

/// Cached handle to one pass of a material instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassHandle {
    material: MaterialHandle,
    technique: u16,
    pass: u16,
}

impl PassHandle {
    pub fn material(&self) -> MaterialHandle {
        self.material
    }
}

/// A named pass of a technique
#[derive(Debug, Clone)]
pub struct PassDefinition {
    pub name: String,
    pub state: PassState,
    /// Parameters visible to this pass, all of them when `None`.
    pub parameters: Option<Vec<String>>,
}

impl PassDefinition {
    pub fn new(name: &str, state: PassState) -> Self {
        Self {
            name: name.to_string(),
            state,
            parameters: None,
        }
    }

    /// Restrict the pass to the listed parameters, in material declaration order.
    pub fn using(mut self, parameters: &[&str]) -> Self {
        self.parameters = Some(parameters.iter().map(|p| p.to_string()).collect());
        self
    }
}

/// Passes a material runs for one render queue
#[derive(Debug, Clone)]
pub struct TechniqueDefinition {
    pub queue: RenderQueue,
    pub passes: Vec<PassDefinition>,
}

/// A declared material parameter
#[derive(Debug, Clone)]
pub struct ParameterDefinition {
    pub name: String,
    pub default: MaterialVariant,
    /// When set, the value is taken from the semantic registry at bind time.
    pub semantic: Option<Semantic>,
}

/// Template instances are created from
#[derive(Debug, Clone)]
pub struct MaterialDefinition {
    pub name: String,
    pub techniques: Vec<TechniqueDefinition>,
    pub parameters: Vec<ParameterDefinition>,
}

impl MaterialDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            techniques: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn with_technique(mut self, queue: RenderQueue, passes: Vec<PassDefinition>) -> Self {
        self.techniques.push(TechniqueDefinition { queue, passes });
        self
    }

    pub fn with_parameter<T: VariantAssign>(mut self, name: &str, value: T) -> Self {
        self.parameters.push(ParameterDefinition {
            name: name.to_string(),
            default: MaterialVariant::from_value(value),
            semantic: None,
        });
        self
    }

    /// Texture parameter with no default binding.
    pub fn with_texture(mut self, name: &str) -> Self {
        self.parameters.push(ParameterDefinition {
            name: name.to_string(),
            default: MaterialVariant::of_type(VariantType::Texture),
            semantic: None,
        });
        self
    }

    /// Parameter whose value comes from `semantic`.
    pub fn with_semantic(mut self, name: &str, semantic: Semantic) -> Self {
        self.parameters.push(ParameterDefinition {
            name: name.to_string(),
            default: MaterialVariant::new(),
            semantic: Some(semantic),
        });
        self
    }
}

struct Registered {
    definition: MaterialDefinition,
    /// Pass ids indexed by technique then pass.
    pass_ids: Vec<Vec<PassId>>,
}

struct Material {
    definition: usize,
    parameters: Vec<MaterialVariant>,
}

/// A pass resolved for drawing: render state plus parameter values
#[derive(Debug, Clone)]
pub struct PassBinding<'a> {
    pub id: PassId,
    pub state: &'a PassState,
    pub parameters: Vec<(&'a str, &'a MaterialVariant)>,
}

/// Registry of material definitions and the instances created from them
#[derive(Default)]
pub struct MaterialLibrary {
    definitions: Vec<Registered>,
    by_name: HashMap<String, usize>,
    materials: Vec<Option<Material>>,
    free: Vec<u32>,
    next_pass_id: u32,
}

impl MaterialLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Library holding every material the pipeline itself needs.
    pub fn with_builtin() -> Self {
        let mut library = Self::new();
        for definition in super::builtin::definitions() {
            library.register(definition);
        }
        library
    }

    /// Register a definition, replacing any earlier one with the same name.
    ///
    /// Existing instances keep the definition they were created from.
    pub fn register(&mut self, definition: MaterialDefinition) {
        let pass_ids = definition
            .techniques
            .iter()
            .map(|t| {
                t.passes
                    .iter()
                    .map(|_| {
                        let id = PassId(self.next_pass_id);
                        self.next_pass_id += 1;
                        id
                    })
                    .collect()
            })
            .collect();
        log::trace!("Registering material '{}'", definition.name);
        self.by_name
            .insert(definition.name.clone(), self.definitions.len());
        self.definitions.push(Registered {
            definition,
            pass_ids,
        });
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Instantiate a registered material with its default parameter values.
    pub fn create_material(&mut self, name: &str) -> PipelineResult<MaterialHandle> {
        let definition = *self
            .by_name
            .get(name)
            .ok_or_else(|| PipelineError::MaterialNotFound(name.to_string()))?;
        let parameters = self.definitions[definition]
            .definition
            .parameters
            .iter()
            .map(|p| p.default.clone())
            .collect();
        let material = Material {
            definition,
            parameters,
        };

        let handle = match self.free.pop() {
            Some(index) => {
                self.materials[index as usize] = Some(material);
                MaterialHandle(index)
            }
            None => {
                self.materials.push(Some(material));
                MaterialHandle(self.materials.len() as u32 - 1)
            }
        };
        Ok(handle)
    }

    pub fn destroy_material(&mut self, material: MaterialHandle) {
        if let Some(slot) = self.materials.get_mut(material.0 as usize) {
            if slot.take().is_some() {
                self.free.push(material.0);
            }
        }
    }

    pub fn live_materials(&self) -> usize {
        self.materials.iter().filter(|m| m.is_some()).count()
    }

    #[track_caller]
    fn instance(&self, material: MaterialHandle) -> &Material {
        self.materials
            .get(material.0 as usize)
            .and_then(|m| m.as_ref())
            .unwrap_or_else(|| panic!("use of destroyed material {material:?}"))
    }

    #[track_caller]
    fn definition_of(&self, material: MaterialHandle) -> &Registered {
        &self.definitions[self.instance(material).definition]
    }

    pub fn material_name(&self, material: MaterialHandle) -> &str {
        &self.definition_of(material).definition.name
    }

    fn technique_index(&self, material: MaterialHandle, queue: RenderQueue) -> Option<usize> {
        self.definition_of(material)
            .definition
            .techniques
            .iter()
            .position(|t| t.queue == queue)
    }

    /// Whether the material renders in `queue`.
    pub fn has_technique(&self, material: MaterialHandle, queue: RenderQueue) -> bool {
        self.technique_index(material, queue).is_some()
    }

    /// First pass of the material's technique for `queue`.
    pub fn get_tech(&self, material: MaterialHandle, queue: RenderQueue) -> Option<PassHandle> {
        let technique = self.technique_index(material, queue)?;
        Some(PassHandle {
            material,
            technique: technique as u16,
            pass: 0,
        })
    }

    /// Named pass of the material's technique for `queue`.
    pub fn find_pass(
        &self,
        material: MaterialHandle,
        queue: RenderQueue,
        pass: &str,
    ) -> Option<PassHandle> {
        let technique = self.technique_index(material, queue)?;
        let index = self.definition_of(material).definition.techniques[technique]
            .passes
            .iter()
            .position(|p| p.name == pass)?;
        Some(PassHandle {
            material,
            technique: technique as u16,
            pass: index as u16,
        })
    }

    /// Like [`find_pass`](Self::find_pass) but reports what was missing.
    pub fn require_pass(
        &self,
        material: MaterialHandle,
        queue: RenderQueue,
        pass: &str,
    ) -> PipelineResult<PassHandle> {
        if !self.has_technique(material, queue) {
            return Err(PipelineError::TechniqueNotFound {
                material: self.material_name(material).to_string(),
                queue,
            });
        }
        self.find_pass(material, queue, pass)
            .ok_or_else(|| PipelineError::PassNotFound {
                material: self.material_name(material).to_string(),
                pass: pass.to_string(),
            })
    }

    pub fn pass_name(&self, pass: PassHandle) -> &str {
        &self.pass_definition(pass).name
    }

    fn pass_definition(&self, pass: PassHandle) -> &PassDefinition {
        &self.definition_of(pass.material).definition.techniques[pass.technique as usize].passes
            [pass.pass as usize]
    }

    pub fn get_parameter(&self, material: MaterialHandle, name: &str) -> Option<ParameterHandle> {
        let index = self
            .definition_of(material)
            .definition
            .parameters
            .iter()
            .position(|p| p.name == name)?;
        Some(ParameterHandle {
            material,
            index: index as u32,
        })
    }

    /// Like [`get_parameter`](Self::get_parameter) but reports a missing name.
    pub fn require_parameter(
        &self,
        material: MaterialHandle,
        name: &str,
    ) -> PipelineResult<ParameterHandle> {
        self.get_parameter(material, name)
            .ok_or_else(|| PipelineError::ParameterNotFound {
                material: self.material_name(material).to_string(),
                parameter: name.to_string(),
            })
    }

    pub fn parameter(&self, parameter: ParameterHandle) -> &MaterialVariant {
        &self.instance(parameter.material).parameters[parameter.index as usize]
    }

    pub fn parameter_mut(&mut self, parameter: ParameterHandle) -> &mut MaterialVariant {
        let material = self
            .materials
            .get_mut(parameter.material.0 as usize)
            .and_then(|m| m.as_mut())
            .unwrap_or_else(|| panic!("use of destroyed material {:?}", parameter.material));
        &mut material.parameters[parameter.index as usize]
    }

    pub fn set<T: VariantAssign>(&mut self, parameter: ParameterHandle, value: T) {
        self.parameter_mut(parameter).assign(value);
    }

    /// One-off assignment by name, for setup code.
    pub fn set_by_name<T: VariantAssign>(
        &mut self,
        material: MaterialHandle,
        name: &str,
        value: T,
    ) -> PipelineResult<()> {
        let parameter = self.require_parameter(material, name)?;
        self.set(parameter, value);
        Ok(())
    }

    /// Resolve a pass for drawing. Semantic-bound parameters read `semantics`.
    pub fn bind<'a>(&'a self, pass: PassHandle, semantics: &'a MaterialSemantics) -> PassBinding<'a> {
        let registered = self.definition_of(pass.material);
        let instance = self.instance(pass.material);
        let pass_def = self.pass_definition(pass);

        let parameters = registered
            .definition
            .parameters
            .iter()
            .zip(&instance.parameters)
            .filter(|(def, _)| match &pass_def.parameters {
                Some(names) => names.iter().any(|n| *n == def.name),
                None => true,
            })
            .map(|(def, value)| {
                let value = match def.semantic {
                    Some(semantic) => semantics.get(semantic),
                    None => value,
                };
                (def.name.as_str(), value)
            })
            .filter(|(_, value)| !value.is_none())
            .collect();

        PassBinding {
            id: registered.pass_ids[pass.technique as usize][pass.pass as usize],
            state: &pass_def.state,
            parameters,
        }
    }

    /// Build a draw call for `pass`.
    pub fn draw_call<'a>(
        &'a self,
        label: &'a str,
        pass: PassHandle,
        semantics: &'a MaterialSemantics,
        geometry: Geometry<'a>,
    ) -> DrawCall<'a> {
        let binding = self.bind(pass, semantics);
        DrawCall {
            label,
            pass: binding.id,
            state: binding.state,
            parameters: binding.parameters,
            geometry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BlendState, TextureHandle, TextureView};
    use crate::material::TextureBinding;
    use glam::Vec4;

    fn library() -> MaterialLibrary {
        let mut library = MaterialLibrary::new();
        library.register(
            MaterialDefinition::new("test")
                .with_technique(
                    RenderQueue::Opaque,
                    vec![
                        PassDefinition::new("gbuffer", PassState::geometry()).using(&["color"]),
                        PassDefinition::new(
                            "shading",
                            PassState::fullscreen(Some(BlendState::additive())),
                        ),
                    ],
                )
                .with_parameter("color", Vec4::ONE)
                .with_semantic("lighting", Semantic::LightingBuffer),
        );
        library
    }

    #[test]
    fn test_create_unknown_material() {
        let mut library = library();
        assert!(matches!(
            library.create_material("missing"),
            Err(PipelineError::MaterialNotFound(_))
        ));
    }

    #[test]
    fn test_get_tech_and_find_pass() {
        let mut library = library();
        let material = library.create_material("test").unwrap();

        let tech = library.get_tech(material, RenderQueue::Opaque).unwrap();
        assert_eq!(library.pass_name(tech), "gbuffer");
        let shading = library
            .find_pass(material, RenderQueue::Opaque, "shading")
            .unwrap();
        assert_eq!(library.pass_name(shading), "shading");

        assert!(library.get_tech(material, RenderQueue::Transparent).is_none());
        assert!(matches!(
            library.require_pass(material, RenderQueue::Shadow, "shadow"),
            Err(PipelineError::TechniqueNotFound { .. })
        ));
    }

    #[test]
    fn test_instances_have_independent_parameters() {
        let mut library = library();
        let a = library.create_material("test").unwrap();
        let b = library.create_material("test").unwrap();

        let color_a = library.get_parameter(a, "color").unwrap();
        library.set(color_a, Vec4::new(1.0, 0.0, 0.0, 1.0));

        let color_b = library.get_parameter(b, "color").unwrap();
        assert_eq!(library.parameter(color_b).get_float4(), Vec4::ONE);
        assert_eq!(
            library.parameter(color_a).get_float4(),
            Vec4::new(1.0, 0.0, 0.0, 1.0)
        );
    }

    #[test]
    fn test_bind_resolves_semantics_and_filters() {
        let mut library = library();
        let material = library.create_material("test").unwrap();
        let mut semantics = MaterialSemantics::new();
        let view = TextureView::new(TextureHandle(3));
        semantics.set(Semantic::LightingBuffer, TextureBinding::new(view));

        let gbuffer = library.get_tech(material, RenderQueue::Opaque).unwrap();
        let binding = library.bind(gbuffer, &semantics);
        assert_eq!(binding.parameters.len(), 1);
        assert_eq!(binding.parameters[0].0, "color");

        let shading = library
            .find_pass(material, RenderQueue::Opaque, "shading")
            .unwrap();
        let binding = library.bind(shading, &semantics);
        assert_eq!(binding.parameters.len(), 2);
        assert_eq!(binding.parameters[1].1.as_texture().unwrap().view, view);
    }

    #[test]
    fn test_unset_semantics_are_skipped() {
        let mut library = library();
        let material = library.create_material("test").unwrap();
        let semantics = MaterialSemantics::new();
        let shading = library
            .find_pass(material, RenderQueue::Opaque, "shading")
            .unwrap();
        assert_eq!(library.bind(shading, &semantics).parameters.len(), 1);
    }

    #[test]
    fn test_pass_ids_are_unique() {
        let mut library = library();
        let a = library.create_material("test").unwrap();
        let b = library.create_material("test").unwrap();
        let semantics = MaterialSemantics::new();

        let pass_a = library.get_tech(a, RenderQueue::Opaque).unwrap();
        let pass_b = library.get_tech(b, RenderQueue::Opaque).unwrap();
        let shading = library.find_pass(a, RenderQueue::Opaque, "shading").unwrap();
        assert_eq!(
            library.bind(pass_a, &semantics).id,
            library.bind(pass_b, &semantics).id
        );
        assert_ne!(
            library.bind(pass_a, &semantics).id,
            library.bind(shading, &semantics).id
        );
    }

    #[test]
    fn test_destroyed_slots_are_reused() {
        let mut library = library();
        let a = library.create_material("test").unwrap();
        library.destroy_material(a);
        assert_eq!(library.live_materials(), 0);
        let b = library.create_material("test").unwrap();
        assert_eq!(a, b);
    }
}
