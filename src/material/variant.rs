//! Typed uniform value box
//!
//! A [`MaterialVariant`] holds exactly one shader-uniform shape at a time.
//! Scalars and vectors live inline; matrices and arrays own a heap payload
//! that is released before the payload of a new type is allocated.

use std::cell::Cell;
use std::fmt;

use glam::{IVec2, IVec3, IVec4, Mat3, Mat4, Vec2, Vec3, Vec4};

use crate::backend::{SamplerState, TextureView};

thread_local! {
    static LIVE_PAYLOADS: Cell<usize> = const { Cell::new(0) };
}

/// Number of heap payloads owned by variants on the current thread.
///
/// Used to check that type transitions neither leak nor double free.
pub fn live_payloads() -> usize {
    LIVE_PAYLOADS.with(|count| count.get())
}

/// Heap-owned payload that keeps the live payload count.
#[derive(PartialEq)]
struct Heap<T: ?Sized>(Box<T>);

impl<T> Heap<T> {
    fn new(value: T) -> Self {
        LIVE_PAYLOADS.with(|count| count.set(count.get() + 1));
        Self(Box::new(value))
    }
}

impl<T: Clone> Heap<[T]> {
    fn from_slice(values: &[T]) -> Self {
        LIVE_PAYLOADS.with(|count| count.set(count.get() + 1));
        Self(values.to_vec().into_boxed_slice())
    }

    fn filled(value: T, len: usize) -> Self {
        LIVE_PAYLOADS.with(|count| count.set(count.get() + 1));
        Self(vec![value; len].into_boxed_slice())
    }
}

impl<T: ?Sized> Drop for Heap<T> {
    fn drop(&mut self) {
        LIVE_PAYLOADS.with(|count| count.set(count.get() - 1));
    }
}

impl<T: Clone> Clone for Heap<T> {
    fn clone(&self) -> Self {
        Heap::new((*self.0).clone())
    }
}

impl<T: Clone> Clone for Heap<[T]> {
    fn clone(&self) -> Self {
        Heap::from_slice(&self.0)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Heap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Element shape of a uniform value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Bool,
    Int,
    Int2,
    Int3,
    Int4,
    Float,
    Float2,
    Float3,
    Float4,
    Float3x3,
    Float4x4,
}

impl ElementType {
    /// Number of 16-byte slots one element occupies when uploaded.
    pub fn slots(&self) -> usize {
        match self {
            ElementType::Float3x3 => 3,
            ElementType::Float4x4 => 4,
            _ => 1,
        }
    }
}

/// Type tag of a [`MaterialVariant`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VariantType {
    #[default]
    None,
    Scalar(ElementType),
    /// Array of `len` elements
    Array(ElementType, usize),
    Texture,
}

/// Texture plus sampler bound to a material parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureBinding {
    pub view: TextureView,
    pub sampler: SamplerState,
}

impl TextureBinding {
    pub fn new(view: TextureView) -> Self {
        Self {
            view,
            sampler: SamplerState::default(),
        }
    }

    pub fn point(view: TextureView) -> Self {
        Self {
            view,
            sampler: SamplerState::point_clamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i32),
    Int2(IVec2),
    Int3(IVec3),
    Int4(IVec4),
    Float(f32),
    Float2(Vec2),
    Float3(Vec3),
    Float4(Vec4),
    Float3x3(Heap<Mat3>),
    Float4x4(Heap<Mat4>),
    BoolArray(Heap<[bool]>),
    IntArray(Heap<[i32]>),
    Int2Array(Heap<[IVec2]>),
    Int3Array(Heap<[IVec3]>),
    Int4Array(Heap<[IVec4]>),
    FloatArray(Heap<[f32]>),
    Float2Array(Heap<[Vec2]>),
    Float3Array(Heap<[Vec3]>),
    Float4Array(Heap<[Vec4]>),
    Float3x3Array(Heap<[Mat3]>),
    Float4x4Array(Heap<[Mat4]>),
    Texture(TextureBinding),
}

impl Value {
    fn variant_type(&self) -> VariantType {
        use ElementType as E;
        use VariantType::{Array, Scalar};
        match self {
            Value::None => VariantType::None,
            Value::Bool(_) => Scalar(E::Bool),
            Value::Int(_) => Scalar(E::Int),
            Value::Int2(_) => Scalar(E::Int2),
            Value::Int3(_) => Scalar(E::Int3),
            Value::Int4(_) => Scalar(E::Int4),
            Value::Float(_) => Scalar(E::Float),
            Value::Float2(_) => Scalar(E::Float2),
            Value::Float3(_) => Scalar(E::Float3),
            Value::Float4(_) => Scalar(E::Float4),
            Value::Float3x3(_) => Scalar(E::Float3x3),
            Value::Float4x4(_) => Scalar(E::Float4x4),
            Value::BoolArray(v) => Array(E::Bool, v.0.len()),
            Value::IntArray(v) => Array(E::Int, v.0.len()),
            Value::Int2Array(v) => Array(E::Int2, v.0.len()),
            Value::Int3Array(v) => Array(E::Int3, v.0.len()),
            Value::Int4Array(v) => Array(E::Int4, v.0.len()),
            Value::FloatArray(v) => Array(E::Float, v.0.len()),
            Value::Float2Array(v) => Array(E::Float2, v.0.len()),
            Value::Float3Array(v) => Array(E::Float3, v.0.len()),
            Value::Float4Array(v) => Array(E::Float4, v.0.len()),
            Value::Float3x3Array(v) => Array(E::Float3x3, v.0.len()),
            Value::Float4x4Array(v) => Array(E::Float4x4, v.0.len()),
            Value::Texture(_) => VariantType::Texture,
        }
    }

    /// Zeroed storage for `ty`. Allocates for matrices and arrays.
    fn zeroed(ty: VariantType) -> Value {
        use ElementType as E;
        match ty {
            VariantType::None => Value::None,
            VariantType::Texture => Value::Texture(TextureBinding::new(TextureView::new(
                crate::backend::TextureHandle(0),
            ))),
            VariantType::Scalar(element) => match element {
                E::Bool => Value::Bool(false),
                E::Int => Value::Int(0),
                E::Int2 => Value::Int2(IVec2::ZERO),
                E::Int3 => Value::Int3(IVec3::ZERO),
                E::Int4 => Value::Int4(IVec4::ZERO),
                E::Float => Value::Float(0.0),
                E::Float2 => Value::Float2(Vec2::ZERO),
                E::Float3 => Value::Float3(Vec3::ZERO),
                E::Float4 => Value::Float4(Vec4::ZERO),
                E::Float3x3 => Value::Float3x3(Heap::new(Mat3::ZERO)),
                E::Float4x4 => Value::Float4x4(Heap::new(Mat4::ZERO)),
            },
            VariantType::Array(element, len) => match element {
                E::Bool => Value::BoolArray(Heap::filled(false, len)),
                E::Int => Value::IntArray(Heap::filled(0, len)),
                E::Int2 => Value::Int2Array(Heap::filled(IVec2::ZERO, len)),
                E::Int3 => Value::Int3Array(Heap::filled(IVec3::ZERO, len)),
                E::Int4 => Value::Int4Array(Heap::filled(IVec4::ZERO, len)),
                E::Float => Value::FloatArray(Heap::filled(0.0, len)),
                E::Float2 => Value::Float2Array(Heap::filled(Vec2::ZERO, len)),
                E::Float3 => Value::Float3Array(Heap::filled(Vec3::ZERO, len)),
                E::Float4 => Value::Float4Array(Heap::filled(Vec4::ZERO, len)),
                E::Float3x3 => Value::Float3x3Array(Heap::filled(Mat3::ZERO, len)),
                E::Float4x4 => Value::Float4x4Array(Heap::filled(Mat4::ZERO, len)),
            },
        }
    }
}

/// A single homogeneous shader-uniform container
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MaterialVariant {
    value: Value,
}

impl MaterialVariant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variant already holding `value`.
    pub fn from_value<T: VariantAssign>(value: T) -> Self {
        let mut variant = Self::new();
        variant.assign(value);
        variant
    }

    /// Variant of type `ty` with zeroed contents.
    pub fn of_type(ty: VariantType) -> Self {
        let mut variant = Self::new();
        variant.set_type(ty);
        variant
    }

    pub fn variant_type(&self) -> VariantType {
        self.value.variant_type()
    }

    pub fn is_none(&self) -> bool {
        matches!(self.value, Value::None)
    }

    /// Change the stored type. The old payload is released before the new
    /// one is allocated; setting the current type keeps the storage as is.
    pub fn set_type(&mut self, ty: VariantType) {
        if self.variant_type() == ty {
            return;
        }
        self.value = Value::None;
        self.value = Value::zeroed(ty);
    }

    /// Set the type implied by `value` and write it.
    pub fn assign<T: VariantAssign>(&mut self, value: T) {
        self.set_type(value.variant_type());
        value.write(self);
    }

    /// RGBA view of a float3/float4 value, used as a draw tint.
    pub fn as_color(&self) -> Option<[f32; 4]> {
        match &self.value {
            Value::Float4(v) => Some(v.to_array()),
            Value::Float3(v) => Some(v.extend(1.0).to_array()),
            _ => None,
        }
    }

    pub fn as_texture(&self) -> Option<&TextureBinding> {
        match &self.value {
            Value::Texture(binding) => Some(binding),
            _ => None,
        }
    }

    /// Append the value as 16-byte aligned slots (vectors padded to vec4,
    /// matrices as padded columns, one slot per array element).
    pub fn write_std140(&self, out: &mut Vec<u8>) {
        fn slot(out: &mut Vec<u8>, words: [u32; 4]) {
            out.extend_from_slice(bytemuck::cast_slice(&words));
        }
        fn f(v: f32) -> u32 {
            v.to_bits()
        }
        fn i(v: i32) -> u32 {
            v as u32
        }
        fn mat3(out: &mut Vec<u8>, m: &Mat3) {
            for c in m.to_cols_array_2d() {
                slot(out, [f(c[0]), f(c[1]), f(c[2]), 0]);
            }
        }
        fn mat4(out: &mut Vec<u8>, m: &Mat4) {
            for c in m.to_cols_array_2d() {
                slot(out, [f(c[0]), f(c[1]), f(c[2]), f(c[3])]);
            }
        }

        match &self.value {
            Value::None | Value::Texture(_) => {}
            Value::Bool(v) => slot(out, [*v as u32, 0, 0, 0]),
            Value::Int(v) => slot(out, [i(*v), 0, 0, 0]),
            Value::Int2(v) => slot(out, [i(v.x), i(v.y), 0, 0]),
            Value::Int3(v) => slot(out, [i(v.x), i(v.y), i(v.z), 0]),
            Value::Int4(v) => slot(out, [i(v.x), i(v.y), i(v.z), i(v.w)]),
            Value::Float(v) => slot(out, [f(*v), 0, 0, 0]),
            Value::Float2(v) => slot(out, [f(v.x), f(v.y), 0, 0]),
            Value::Float3(v) => slot(out, [f(v.x), f(v.y), f(v.z), 0]),
            Value::Float4(v) => slot(out, [f(v.x), f(v.y), f(v.z), f(v.w)]),
            Value::Float3x3(m) => mat3(out, &m.0),
            Value::Float4x4(m) => mat4(out, &m.0),
            Value::BoolArray(a) => a.0.iter().for_each(|v| slot(out, [*v as u32, 0, 0, 0])),
            Value::IntArray(a) => a.0.iter().for_each(|v| slot(out, [i(*v), 0, 0, 0])),
            Value::Int2Array(a) => a.0.iter().for_each(|v| slot(out, [i(v.x), i(v.y), 0, 0])),
            Value::Int3Array(a) => a
                .0
                .iter()
                .for_each(|v| slot(out, [i(v.x), i(v.y), i(v.z), 0])),
            Value::Int4Array(a) => a
                .0
                .iter()
                .for_each(|v| slot(out, [i(v.x), i(v.y), i(v.z), i(v.w)])),
            Value::FloatArray(a) => a.0.iter().for_each(|v| slot(out, [f(*v), 0, 0, 0])),
            Value::Float2Array(a) => a.0.iter().for_each(|v| slot(out, [f(v.x), f(v.y), 0, 0])),
            Value::Float3Array(a) => a
                .0
                .iter()
                .for_each(|v| slot(out, [f(v.x), f(v.y), f(v.z), 0])),
            Value::Float4Array(a) => a
                .0
                .iter()
                .for_each(|v| slot(out, [f(v.x), f(v.y), f(v.z), f(v.w)])),
            Value::Float3x3Array(a) => a.0.iter().for_each(|m| mat3(out, m)),
            Value::Float4x4Array(a) => a.0.iter().for_each(|m| mat4(out, m)),
        }
    }
}

#[track_caller]
fn type_mismatch(requested: &str, stored: VariantType) -> ! {
    panic!("MaterialVariant type mismatch: requested {requested}, stored {stored:?}")
}

macro_rules! scalar_getters {
    ($($getter:ident => $variant:ident : $ty:ty),* $(,)?) => {
        impl MaterialVariant {
            $(
                #[track_caller]
                pub fn $getter(&self) -> $ty {
                    match &self.value {
                        Value::$variant(v) => *v,
                        other => type_mismatch(stringify!($variant), other.variant_type()),
                    }
                }
            )*
        }
    };
}

macro_rules! heap_getters {
    ($($getter:ident => $variant:ident : $ty:ty),* $(,)?) => {
        impl MaterialVariant {
            $(
                #[track_caller]
                pub fn $getter(&self) -> &$ty {
                    match &self.value {
                        Value::$variant(v) => &v.0,
                        other => type_mismatch(stringify!($variant), other.variant_type()),
                    }
                }
            )*
        }
    };
}

scalar_getters! {
    get_bool => Bool: bool,
    get_int => Int: i32,
    get_int2 => Int2: IVec2,
    get_int3 => Int3: IVec3,
    get_int4 => Int4: IVec4,
    get_float => Float: f32,
    get_float2 => Float2: Vec2,
    get_float3 => Float3: Vec3,
    get_float4 => Float4: Vec4,
    get_texture => Texture: TextureBinding,
}

heap_getters! {
    get_float3x3 => Float3x3: Mat3,
    get_float4x4 => Float4x4: Mat4,
    get_bool_array => BoolArray: [bool],
    get_int_array => IntArray: [i32],
    get_int2_array => Int2Array: [IVec2],
    get_int3_array => Int3Array: [IVec3],
    get_int4_array => Int4Array: [IVec4],
    get_float_array => FloatArray: [f32],
    get_float2_array => Float2Array: [Vec2],
    get_float3_array => Float3Array: [Vec3],
    get_float4_array => Float4Array: [Vec4],
    get_float3x3_array => Float3x3Array: [Mat3],
    get_float4x4_array => Float4x4Array: [Mat4],
}

/// Values that can be assigned into a [`MaterialVariant`]
pub trait VariantAssign {
    /// Type the variant takes on when this value is assigned.
    fn variant_type(&self) -> VariantType;

    /// Write into storage that already has `self.variant_type()`.
    #[doc(hidden)]
    fn write(self, target: &mut MaterialVariant);
}

macro_rules! assign_inline {
    ($($ty:ty => $variant:ident, $element:ident);* $(;)?) => {
        $(
            impl VariantAssign for $ty {
                fn variant_type(&self) -> VariantType {
                    VariantType::Scalar(ElementType::$element)
                }

                fn write(self, target: &mut MaterialVariant) {
                    target.value = Value::$variant(self);
                }
            }
        )*
    };
}

macro_rules! assign_heap {
    ($($ty:ty => $variant:ident, $element:ident);* $(;)?) => {
        $(
            impl VariantAssign for $ty {
                fn variant_type(&self) -> VariantType {
                    VariantType::Scalar(ElementType::$element)
                }

                fn write(self, target: &mut MaterialVariant) {
                    if let Value::$variant(payload) = &mut target.value {
                        *payload.0 = self;
                    }
                }
            }
        )*
    };
}

macro_rules! assign_array {
    ($($ty:ty => $variant:ident, $element:ident);* $(;)?) => {
        $(
            impl VariantAssign for &[$ty] {
                fn variant_type(&self) -> VariantType {
                    VariantType::Array(ElementType::$element, self.len())
                }

                fn write(self, target: &mut MaterialVariant) {
                    if let Value::$variant(payload) = &mut target.value {
                        payload.0.copy_from_slice(self);
                    }
                }
            }

            impl VariantAssign for &Vec<$ty> {
                fn variant_type(&self) -> VariantType {
                    self.as_slice().variant_type()
                }

                fn write(self, target: &mut MaterialVariant) {
                    self.as_slice().write(target)
                }
            }
        )*
    };
}

assign_inline! {
    bool => Bool, Bool;
    i32 => Int, Int;
    IVec2 => Int2, Int2;
    IVec3 => Int3, Int3;
    IVec4 => Int4, Int4;
    f32 => Float, Float;
    Vec2 => Float2, Float2;
    Vec3 => Float3, Float3;
    Vec4 => Float4, Float4;
}

assign_heap! {
    Mat3 => Float3x3, Float3x3;
    Mat4 => Float4x4, Float4x4;
}

assign_array! {
    bool => BoolArray, Bool;
    i32 => IntArray, Int;
    IVec2 => Int2Array, Int2;
    IVec3 => Int3Array, Int3;
    IVec4 => Int4Array, Int4;
    f32 => FloatArray, Float;
    Vec2 => Float2Array, Float2;
    Vec3 => Float3Array, Float3;
    Vec4 => Float4Array, Float4;
    Mat3 => Float3x3Array, Float3x3;
    Mat4 => Float4x4Array, Float4x4;
}

impl VariantAssign for TextureBinding {
    fn variant_type(&self) -> VariantType {
        VariantType::Texture
    }

    fn write(self, target: &mut MaterialVariant) {
        target.value = Value::Texture(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TextureHandle;

    #[test]
    fn test_scalar_assign_and_get() {
        let mut variant = MaterialVariant::new();
        variant.assign(2.5f32);
        assert_eq!(variant.variant_type(), VariantType::Scalar(ElementType::Float));
        assert_eq!(variant.get_float(), 2.5);

        variant.assign(Vec4::new(1.0, 0.5, 0.25, 1.0));
        assert_eq!(variant.get_float4(), Vec4::new(1.0, 0.5, 0.25, 1.0));
        assert_eq!(variant.as_color(), Some([1.0, 0.5, 0.25, 1.0]));
    }

    #[test]
    fn test_type_round_trip_does_not_leak() {
        let before = live_payloads();

        let mut single = MaterialVariant::new();
        single.assign(Mat4::IDENTITY);
        let after_single = live_payloads();
        assert_eq!(after_single, before + 1);

        let mut variant = MaterialVariant::new();
        variant.assign(Mat4::IDENTITY);
        variant.assign([1.0f32, 2.0, 3.0].as_slice());
        variant.assign(Mat4::IDENTITY);
        assert_eq!(live_payloads() - after_single, after_single - before);

        drop(variant);
        drop(single);
        assert_eq!(live_payloads(), before);
    }

    #[test]
    fn test_inline_types_do_not_allocate() {
        let before = live_payloads();
        let mut variant = MaterialVariant::new();
        variant.assign(1i32);
        variant.assign(Vec3::ONE);
        variant.assign(true);
        assert_eq!(live_payloads(), before);

        variant.assign([Vec4::ONE, Vec4::ZERO].as_slice());
        assert_eq!(live_payloads(), before + 1);
        variant.assign(0.0f32);
        assert_eq!(live_payloads(), before);
    }

    #[test]
    fn test_same_type_reuses_storage() {
        let mut variant = MaterialVariant::new();
        variant.assign([1.0f32, 2.0].as_slice());
        let before = live_payloads();
        variant.assign([3.0f32, 4.0].as_slice());
        assert_eq!(live_payloads(), before);
        assert_eq!(variant.get_float_array(), &[3.0, 4.0]);
    }

    #[test]
    fn test_array_length_change_is_a_type_change() {
        let mut variant = MaterialVariant::new();
        variant.assign([1i32, 2, 3].as_slice());
        variant.assign([4i32].as_slice());
        assert_eq!(
            variant.variant_type(),
            VariantType::Array(ElementType::Int, 1)
        );
        assert_eq!(variant.get_int_array(), &[4]);
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn test_getter_asserts_type() {
        let variant = MaterialVariant::from_value(1.0f32);
        let _ = variant.get_int();
    }

    #[test]
    fn test_clone_counts_payload() {
        let before = live_payloads();
        let variant = MaterialVariant::from_value(Mat3::IDENTITY);
        let copy = variant.clone();
        assert_eq!(live_payloads(), before + 2);
        assert_eq!(copy.get_float3x3(), &Mat3::IDENTITY);
    }

    #[test]
    fn test_std140_packing() {
        let mut bytes = Vec::new();
        MaterialVariant::from_value(Vec3::new(1.0, 2.0, 3.0)).write_std140(&mut bytes);
        assert_eq!(bytes.len(), 16);

        bytes.clear();
        MaterialVariant::from_value(Mat3::IDENTITY).write_std140(&mut bytes);
        assert_eq!(bytes.len(), 48);

        bytes.clear();
        MaterialVariant::from_value([0.5f32; 5].as_slice()).write_std140(&mut bytes);
        assert_eq!(bytes.len(), 80);
        let words: &[f32] = bytemuck::cast_slice(&bytes[16..20]);
        assert_eq!(words[0], 0.5);
    }

    #[test]
    fn test_texture_binding() {
        let view = TextureView::layer(TextureHandle(7), 3);
        let variant = MaterialVariant::from_value(TextureBinding::point(view));
        assert_eq!(variant.variant_type(), VariantType::Texture);
        assert_eq!(variant.as_texture().map(|b| b.view), Some(view));

        let mut bytes = Vec::new();
        variant.write_std140(&mut bytes);
        assert!(bytes.is_empty());
    }
}
