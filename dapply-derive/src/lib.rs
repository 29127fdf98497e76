//! A derive macro for the `RemoteExecute` trait.
//!
//! Deriving `RemoteExecute` gives an operation a stable name and registers it
//! with the operation registry, so that any process of a group can evaluate
//! it from a serialized function reference. Registration uses the
//! [`linkme`](https://docs.rs/linkme) crate: every derive contributes one
//! entry to a distributed slice that the linker gathers into a contiguous
//! section of the binary.
//!
//! # Implementation details
//!
//! An operation's name is its fully qualified type path, as produced by
//! `module_path!()`. The registry entry pairs that name with a monomorphized
//! copy of `dapply::operation::execute_erased`, which decodes the operation,
//! the shared arguments and every input, evaluates the operation and encodes
//! the outputs. Lookup is by name, which is what a function reference
//! carries over the wire.
extern crate proc_macro;

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{parse_macro_input, Attribute, DeriveInput, Error, Result};

/// Check if the `internal` attribute is present on the derive macro.
///
/// Quoted paths point at `crate` rather than `::dapply` when the macro is
/// invoked from the `dapply` crate itself.
fn get_is_internal(attrs: &mut Vec<Attribute>) -> Result<bool> {
    let mut is_internal = None;
    let mut errors: Option<Error> = None;

    attrs.retain(|attr| {
        if !attr.path().is_ident("dapply") {
            return true;
        }
        if let Err(err) = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("internal") {
                if is_internal.is_some() {
                    return Err(meta.error("duplicate dapply crate attribute"));
                }

                is_internal = Some(true);
                Ok(())
            } else {
                Err(meta.error("unsupported dapply attribute"))
            }
        }) {
            match &mut errors {
                None => errors = Some(err),
                Some(errors) => errors.combine(err),
            }
        }
        false
    });

    match errors {
        None => Ok(is_internal.unwrap_or(false)),
        Some(errors) => Err(errors),
    }
}

/// See the [module level documentation](crate) for more information.
#[proc_macro_derive(RemoteExecute, attributes(dapply))]
pub fn remote_execute_derive(input: TokenStream) -> TokenStream {
    let mut input = parse_macro_input!(input as DeriveInput);

    let is_internal = match get_is_internal(&mut input.attrs) {
        Ok(path) => path,
        Err(err) => return err.to_compile_error().into(),
    };

    // A registry entry holds one function pointer, so it cannot cover a
    // family of types.
    if !input.generics.params.is_empty() {
        return Error::new_spanned(
            &input.generics,
            "RemoteExecute cannot be derived for generic types",
        )
        .to_compile_error()
        .into();
    }

    let dapply_path = if is_internal {
        quote! { crate }
    } else {
        quote! { ::dapply }
    };

    // Point `linkme` at the copy re-exported by `dapply`, so that downstream
    // crates do not need their own `linkme` dependency.
    let linkme_path_override = if is_internal {
        quote! {}
    } else {
        quote! {
            #[linkme(crate = #dapply_path::__private::linkme)]
        }
    };

    let name = &input.ident;
    let entry_name = format_ident!(
        "__DAPPLY_OPERATION_{}",
        name.to_string().to_uppercase(),
        span = name.span()
    );

    let expanded = quote! {
        impl #dapply_path::operation::RemoteExecute for #name {
            const NAME: &'static str = concat!(module_path!(), "::", stringify!(#name));
        }

        #[#dapply_path::__private::linkme::distributed_slice(#dapply_path::__private::OPERATIONS)]
        #linkme_path_override
        #[allow(non_upper_case_globals)]
        static #entry_name: #dapply_path::__private::OperationEntry =
            #dapply_path::__private::OperationEntry {
                name: <#name as #dapply_path::operation::RemoteExecute>::NAME,
                execute: #dapply_path::operation::execute_erased::<#name>,
            };
    };

    TokenStream::from(expanded)
}
