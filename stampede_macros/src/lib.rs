use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, spanned::Spanned, Data, DeriveInput, Fields, LitStr};

extern crate proc_macro;

/// Derives `From<T> for stampede::feeder::Record`, turning a typed struct into
/// a feeder record.
///
/// Every field must implement `Into<serde_json::Value>`. Supported
/// attributes:
/// - `#[record(rename_all = "camelCase")]` on the struct (also `PascalCase`,
///   `snake_case`, `kebab-case`, `lowercase`, `UPPERCASE`,
///   `SCREAMING_SNAKE_CASE`);
/// - `#[record(rename = "name")]` and `#[record(skip)]` on fields.
#[proc_macro_derive(Record, attributes(record))]
pub fn derive_record(item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as DeriveInput);
    expand_record(&ast)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand_record(ast: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &ast.ident;
    let fields = match &ast.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new(
                    ast.span(),
                    "Record can only be derived for structs with named fields",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new(
                ast.span(),
                "Record can only be derived for structs",
            ));
        }
    };

    let mut rename_all: Option<Case> = None;
    for attr in ast.attrs.iter().filter(|a| a.path().is_ident("record")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename_all") {
                let lit: LitStr = meta.value()?.parse()?;
                rename_all = Some(
                    Case::parse(&lit.value())
                        .ok_or_else(|| syn::Error::new(lit.span(), "unknown rename_all case"))?,
                );
                Ok(())
            } else {
                Err(meta.error("unsupported record attribute"))
            }
        })?;
    }

    let mut inserts = Vec::new();
    for field in fields {
        let Some(ident) = &field.ident else {
            continue;
        };
        let mut key = None;
        let mut skip = false;
        for attr in field.attrs.iter().filter(|a| a.path().is_ident("record")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("rename") {
                    let lit: LitStr = meta.value()?.parse()?;
                    key = Some(lit.value());
                    Ok(())
                } else if meta.path.is_ident("skip") {
                    skip = true;
                    Ok(())
                } else {
                    Err(meta.error("unsupported record attribute"))
                }
            })?;
        }
        if skip {
            continue;
        }
        let raw = ident.to_string();
        let raw = raw.strip_prefix("r#").unwrap_or(&raw);
        let key = key.unwrap_or_else(|| match rename_all {
            Some(case) => case.apply(raw),
            None => raw.to_owned(),
        });
        inserts.push(quote! {
            record.insert(
                ::std::string::String::from(#key),
                ::stampede::session::Value::from(value.#ident),
            );
        });
    }

    let capacity = inserts.len();
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();
    Ok(quote! {
        impl #impl_generics ::core::convert::From<#name #ty_generics> for ::stampede::feeder::Record #where_clause {
            fn from(value: #name #ty_generics) -> Self {
                let mut record = ::stampede::feeder::Record::with_capacity(#capacity);
                #(#inserts)*
                record
            }
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Case {
    Lower,
    Upper,
    Pascal,
    Camel,
    Snake,
    ScreamingSnake,
    Kebab,
}

impl Case {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "lowercase" => Self::Lower,
            "UPPERCASE" => Self::Upper,
            "PascalCase" => Self::Pascal,
            "camelCase" => Self::Camel,
            "snake_case" => Self::Snake,
            "SCREAMING_SNAKE_CASE" => Self::ScreamingSnake,
            "kebab-case" => Self::Kebab,
            _ => return None,
        })
    }

    /// Converts a snake_case field name.
    fn apply(self, field: &str) -> String {
        match self {
            Self::Lower | Self::Snake => field.to_owned(),
            Self::Upper | Self::ScreamingSnake => field.to_ascii_uppercase(),
            Self::Kebab => field.replace('_', "-"),
            Self::Pascal | Self::Camel => {
                let mut out = String::with_capacity(field.len());
                let mut upper = self == Self::Pascal;
                for c in field.chars() {
                    if c == '_' {
                        upper = true;
                    } else if upper {
                        out.extend(c.to_uppercase());
                        upper = false;
                    } else {
                        out.push(c);
                    }
                }
                out
            }
        }
    }
}
