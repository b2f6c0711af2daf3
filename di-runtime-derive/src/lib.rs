//! Derive macros for di-runtime
//!
//! `#[derive(Service)]` implements `di_runtime::verified::Service` for a
//! struct whose dependencies are `Arc<T>` fields marked `#[dep]`. The
//! generated `Dependencies` type lists those fields in declaration order,
//! so the container's dependency list always matches what the struct holds.
//!
//! # Example
//!
//! ```rust,ignore
//! use di_runtime::{Container, Lifetime, Service, verified::ServiceProvider};
//! use std::sync::Arc;
//!
//! struct Config { debug: bool }
//!
//! #[derive(Service)]
//! struct Database {
//!     #[dep]
//!     config: Arc<Config>,
//!     // Non-dep fields use Default
//!     queries: std::sync::atomic::AtomicU64,
//! }
//!
//! let container = Container::new();
//! container.register_instance(Config { debug: true })?;
//! container.provide::<Database>(Lifetime::Singleton)?;
//! ```

use proc_macro::TokenStream;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, Type, parse_macro_input};

/// Tuples of up to this many `Arc`s implement `Resolvable`.
const MAX_DEPENDENCIES: usize = 8;

/// Extract T from Arc<T>
fn extract_arc_inner_type(ty: &Type) -> Option<&Type> {
    if let Type::Path(type_path) = ty {
        let segment = type_path.path.segments.last()?;
        if segment.ident == "Arc" {
            if let syn::PathArguments::AngleBracketed(args) = &segment.arguments {
                if let Some(syn::GenericArgument::Type(inner)) = args.args.first() {
                    return Some(inner);
                }
            }
        }
    }
    None
}

/// Whether the field carries a `#[dep]` attribute.
///
/// `#[dep]` takes no arguments; anything else is reported at the attribute.
fn find_dep_attr(attrs: &[Attribute]) -> syn::Result<bool> {
    for attr in attrs {
        if attr.path().is_ident("dep") {
            attr.meta.require_path_only().map_err(|_| {
                syn::Error::new_spanned(attr, "#[dep] does not take arguments")
            })?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Derive macro for the `Service` trait.
///
/// # Attributes
///
/// - `#[dep]` - Mark a field as a dependency. Must be `Arc<T>`.
///
/// Fields without `#[dep]` use `Default::default()`.
///
/// # Generated Code
///
/// ```rust,ignore
/// #[derive(Service)]
/// struct UserService {
///     #[dep]
///     config: Arc<Config>,
///     #[dep]
///     db: Arc<Database>,
///     request_count: u64,
/// }
///
/// // impl Service for UserService {
/// //     type Dependencies = (Arc<Config>, Arc<Database>);
/// //     fn create((config, db): Self::Dependencies) -> Self {
/// //         Self { config, db, request_count: Default::default() }
/// //     }
/// // }
/// ```
#[proc_macro_derive(Service, attributes(dep))]
pub fn derive_service(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_service(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand_service(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    // Only support structs with named fields
    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    input,
                    "Service can only be derived for structs with named fields",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                input,
                "Service can only be derived for structs",
            ));
        }
    };

    let mut dep_types = Vec::new();
    let mut dep_names = Vec::new();
    let mut field_inits = Vec::new();

    for field in fields {
        let Some(field_name) = field.ident.as_ref() else {
            continue;
        };
        let field_type = &field.ty;

        if !find_dep_attr(&field.attrs)? {
            field_inits.push(quote! {
                #field_name: ::std::default::Default::default()
            });
            continue;
        }

        if extract_arc_inner_type(field_type).is_none() {
            return Err(syn::Error::new_spanned(
                field_type,
                "Fields marked with #[dep] must have type Arc<T>",
            ));
        }

        let dep_name = syn::Ident::new(&format!("__dep_{}", dep_names.len()), field_name.span());
        dep_types.push(field_type);
        field_inits.push(quote! { #field_name: #dep_name });
        dep_names.push(dep_name);
    }

    if dep_types.len() > MAX_DEPENDENCIES {
        return Err(syn::Error::new_spanned(
            name,
            format!(
                "Service supports at most {MAX_DEPENDENCIES} #[dep] fields; group related dependencies into a service of their own"
            ),
        ));
    }

    let (deps_type, deps_pattern) = match dep_types.len() {
        0 => (quote! { () }, quote! { _ }),
        1 => {
            let ty = dep_types[0];
            let name = &dep_names[0];
            (quote! { #ty }, quote! { #name })
        }
        _ => (
            quote! { (#(#dep_types),*) },
            quote! { (#(#dep_names),*) },
        ),
    };

    Ok(quote! {
        impl #impl_generics ::di_runtime::verified::Service for #name #ty_generics #where_clause {
            type Dependencies = #deps_type;

            fn create(#deps_pattern: Self::Dependencies) -> Self {
                Self {
                    #(#field_inits),*
                }
            }
        }
    })
}
