/// Generate the raw-pointer accessor for a `NonNull` resource wrapper.
///
/// The wrappers deliberately implement nothing beyond this: they are
/// plain handles whose lifecycle the owning session drives explicitly,
/// so there is no `Deref` into the C type and no cross-thread marker.
macro_rules! impl_raw_handle {
    ($c_ty:ty, $wrapper_ty:ty) => {
        impl $wrapper_ty {
            /// Get the wrapped raw pointer.
            #[inline]
            pub(crate) fn as_ptr(&self) -> *mut $c_ty {
                self.0.as_ptr()
            }
        }
    };
}
