/// Anything that can be initialized with a `const` value.
///
/// This is what lets a `TagAlloc` (and the platform cells inside it) be
/// constructed in a `static` initializer, where `Default::default` cannot be
/// called.
pub(crate) trait ConstInit {
    /// The `const` default initializer value for `Self`.
    const INIT: Self;
}
