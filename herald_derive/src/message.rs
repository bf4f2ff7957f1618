//! Derive macro for the `Message` trait.

use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Index, LitStr};

/// Converts a PascalCase or camelCase identifier to kebab-case.
///
/// Examples:
/// - `OrderPlaced` -> `order-placed`
/// - `HTTPRequestReceived` -> `http-request-received`
fn to_kebab_case(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut result = String::with_capacity(s.len() + 4);

    for (i, c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            // Split at a camelCase boundary or at the end of an acronym
            if i > 0 {
                let prev = chars[i - 1];
                let next_is_lowercase = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
                if prev.is_lowercase()
                    || prev.is_ascii_digit()
                    || (prev.is_uppercase() && next_is_lowercase)
                {
                    result.push('-');
                }
            }
            result.extend(c.to_lowercase());
        } else if *c == '_' {
            result.push('-');
        } else {
            result.push(*c);
        }
    }

    result
}

/// Reads `#[message(topic = "...")]` from the container attributes.
fn topic_attribute(input: &DeriveInput) -> syn::Result<Option<String>> {
    let mut topic = None;
    for attr in &input.attrs {
        if !attr.path().is_ident("message") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("topic") {
                let value: LitStr = meta.value()?.parse()?;
                if value.value().is_empty() {
                    return Err(syn::Error::new_spanned(&value, "topic name cannot be empty"));
                }
                topic = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("expected `topic = \"...\"`"))
            }
        })?;
    }
    Ok(topic)
}

/// Whether a field carries `#[message(key)]`.
fn is_key_field(field: &syn::Field) -> syn::Result<bool> {
    let mut is_key = false;
    for attr in &field.attrs {
        if !attr.path().is_ident("message") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("key") {
                is_key = true;
                Ok(())
            } else {
                Err(meta.error("expected `key`"))
            }
        })?;
    }
    Ok(is_key)
}

/// Returns the expression accessing the key field on `self`.
fn key_accessor(input: &DeriveInput) -> syn::Result<TokenStream> {
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            input,
            "Message can only be derived for structs",
        ));
    };

    let fields: Vec<&syn::Field> = match &data.fields {
        Fields::Named(fields) => fields.named.iter().collect(),
        Fields::Unnamed(fields) => fields.unnamed.iter().collect(),
        Fields::Unit => Vec::new(),
    };

    let mut accessor = None;
    for (index, field) in fields.into_iter().enumerate() {
        if !is_key_field(field)? {
            continue;
        }
        if accessor.is_some() {
            return Err(syn::Error::new_spanned(
                field,
                "only one field can be marked with #[message(key)]",
            ));
        }
        accessor = Some(match &field.ident {
            Some(ident) => quote! { self.#ident },
            None => {
                let index = Index::from(index);
                quote! { self.#index }
            }
        });
    }

    accessor.ok_or_else(|| {
        syn::Error::new_spanned(
            &input.ident,
            "Message requires one field marked with #[message(key)]",
        )
    })
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream> {
    let topic = match topic_attribute(input)? {
        Some(topic) => topic,
        None => to_kebab_case(&input.ident.to_string()),
    };
    let key = key_accessor(input)?;

    let name = &input.ident;
    let (impl_generics, type_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::herald_core::Message for #name #type_generics #where_clause {
            fn topic_name() -> &'static str {
                #topic
            }

            fn idempotency_key(&self) -> ::std::string::String {
                ::std::string::ToString::to_string(&#key)
            }
        }
    })
}

/// Implementation of the `Message` derive macro.
pub fn message_impl(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let item_tokens: TokenStream = item.into();
    let input = match syn::parse2::<DeriveInput>(item_tokens) {
        Ok(tree) => tree,
        Err(e) => return e.to_compile_error().into(),
    };

    match expand(&input) {
        Ok(expanded) => expanded.into(),
        Err(e) => e.to_compile_error().into(),
    }
}
