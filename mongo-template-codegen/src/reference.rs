//! Implementation of the `#[derive(Reference)]` macro.

use proc_macro2::TokenStream;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, LitStr, Path};

/// Names collected from `#[reference(...)]` attributes.
#[derive(Debug, Default)]
struct ReferenceAttrs {
    database: Option<String>,
    collection: Option<String>,
    krate: Option<Path>,
}

/// Parse and generate code for the `#[derive(Reference)]` macro.
pub fn derive_reference_impl(input: &DeriveInput) -> Result<TokenStream, syn::Error> {
    let name = &input.ident;

    let fields = match &input.data {
        Data::Struct(data) => &data.fields,
        _ => {
            return Err(syn::Error::new_spanned(
                input,
                "Reference derive only supports structs",
            ));
        }
    };

    let mut attrs = ReferenceAttrs::default();
    parse_reference_attrs(&input.attrs, &mut attrs)?;

    if let Fields::Named(named) = fields {
        for field in &named.named {
            parse_reference_attrs(&field.attrs, &mut attrs)?;
        }
    }

    let krate = attrs
        .krate
        .map(|path| quote! { #path })
        .unwrap_or_else(|| quote! { ::mongo_template });

    let database = option_tokens(attrs.database.as_deref());
    let collection = option_tokens(attrs.collection.as_deref());

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics #krate::Reference for #name #ty_generics #where_clause {
            fn database_name() -> ::core::option::Option<&'static str> {
                #database
            }

            fn collection_name() -> ::core::option::Option<&'static str> {
                #collection
            }
        }
    })
}

fn option_tokens(value: Option<&str>) -> TokenStream {
    match value {
        Some(value) => quote! { ::core::option::Option::Some(#value) },
        None => quote! { ::core::option::Option::None },
    }
}

/// Fold every `#[reference(...)]` attribute in `attrs` into `out`.
fn parse_reference_attrs(attrs: &[Attribute], out: &mut ReferenceAttrs) -> Result<(), syn::Error> {
    for attr in attrs {
        if !attr.path().is_ident("reference") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("database") {
                let value: LitStr = meta.value()?.parse()?;
                set_once(&mut out.database, value, "database")
            } else if meta.path.is_ident("collection") {
                let value: LitStr = meta.value()?.parse()?;
                set_once(&mut out.collection, value, "collection")
            } else if meta.path.is_ident("crate") {
                let value: LitStr = meta.value()?.parse()?;
                if out.krate.is_some() {
                    return Err(syn::Error::new_spanned(value, "duplicate `crate` key"));
                }
                out.krate = Some(value.parse()?);
                Ok(())
            } else {
                Err(meta.error("expected `database`, `collection` or `crate`"))
            }
        })?;
    }

    Ok(())
}

fn set_once(slot: &mut Option<String>, value: LitStr, key: &str) -> Result<(), syn::Error> {
    if slot.is_some() {
        return Err(syn::Error::new_spanned(
            &value,
            format!("duplicate `{}` key", key),
        ));
    }
    if value.value().is_empty() {
        return Err(syn::Error::new_spanned(
            &value,
            format!("`{}` must not be empty", key),
        ));
    }
    *slot = Some(value.value());
    Ok(())
}
