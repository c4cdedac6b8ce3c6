//! Creation code of the ERC1967 proxy deployed by the light wallet factories.

/// Proxy used by factories v0.1.0 and v0.2.0.
pub const PROXY_CREATION_CODE_V1: &[&str] = &[
    "608060405260405161078438038061078483398101604081905261002291610319565b61002e82826000610035565b50",
    "50610436565b61003e8361006b565b60008251118061004b5750805b156100665761006483836100ab60201b61002917",
    "60201c565b505b505050565b610074816100d7565b6040516001600160a01b038216907fbc7cd75a20ee27fd9adebab3",
    "2041f755214dbc6bffa90cc0225b39da2e5c2d3b90600090a250565b60606100d0838360405180606001604052806027",
    "815260200161075d602791396101a9565b9392505050565b6100ea8161022260201b6100551760201c565b6101515760",
    "405162461bcd60e51b815260206004820152602d60248201527f455243313936373a206e657720696d706c656d656e74",
    "6174696f6e206973206e60448201526c1bdd08184818dbdb9d1c9858dd609a1b60648201526084015b60405180910390",
    "fd5b806101887f360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc60001b61023160201b",
    "6100711760201c565b80546001600160a01b0319166001600160a01b039290921691909117905550565b606060008085",
    "6001600160a01b0316856040516101c691906103e7565b600060405180830381855af49150503d806000811461020157",
    "6040519150601f19603f3d011682016040523d82523d6000602084013e610206565b606091505b509092509050610218",
    "86838387610234565b9695505050505050565b6001600160a01b03163b151590565b90565b606083156102a357825160",
    "000361029c576001600160a01b0385163b61029c5760405162461bcd60e51b815260206004820152601d60248201527f",
    "416464726573733a2063616c6c20746f206e6f6e2d636f6e74726163740000006044820152606401610148565b508161",
    "02ad565b6102ad83836102b5565b949350505050565b8151156102c55781518083602001fd5b8060405162461bcd60e5",
    "1b81526004016101489190610403565b634e487b7160e01b600052604160045260246000fd5b60005b83811015610310",
    "5781810151838201526020016102f8565b50506000910152565b6000806040838503121561032c57600080fd5b825160",
    "01600160a01b038116811461034357600080fd5b60208401519092506001600160401b038082111561036057600080fd",
    "5b818501915085601f83011261037457600080fd5b815181811115610386576103866102df565b604051601f8201601f",
    "19908116603f011681019083821181831017156103ae576103ae6102df565b8160405282815288602084870101111561",
    "03c757600080fd5b6103d88360208301602088016102f5565b80955050505050509250929050565b600082516103f981",
    "84602087016102f5565b9190910192915050565b60208152600082518060208401526104228160408501602087016102",
    "f5565b601f01601f19169190910160400192915050565b610318806104456000396000f3fe6080604052366100135761",
    "0011610017565b005b6100115b610027610022610074565b6100b9565b565b606061004e838360405180606001604052",
    "80602781526020016102e5602791396100dd565b9392505050565b73ffffffffffffffffffffffffffffffffffffffff",
    "163b151590565b90565b60006100b47f360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc",
    "5473ffffffffffffffffffffffffffffffffffffffff1690565b905090565b3660008037600080366000845af43d6000",
    "803e8080156100d8573d6000f35b3d6000fd5b60606000808573ffffffffffffffffffffffffffffffffffffffff1685",
    "6040516101079190610277565b600060405180830381855af49150503d8060008114610142576040519150601f19603f",
    "3d011682016040523d82523d6000602084013e610147565b606091505b509150915061015886838387610162565b9695",
    "505050505050565b606083156101fd5782516000036101f65773ffffffffffffffffffffffffffffffffffffffff8516",
    "3b6101f6576040517f08c379a00000000000000000000000000000000000000000000000000000000081526020600482",
    "0152601d60248201527f416464726573733a2063616c6c20746f206e6f6e2d636f6e7472616374000000604482015260",
    "64015b60405180910390fd5b5081610207565b610207838361020f565b949350505050565b81511561021f5781518083",
    "602001fd5b806040517f08c379a000000000000000000000000000000000000000000000000000000000815260040161",
    "01ed9190610293565b60005b8381101561026e578181015183820152602001610256565b50506000910152565b600082",
    "51610289818460208701610253565b9190910192915050565b60208152600082518060208401526102b2816040850160",
    "208701610253565b601f017fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffe016919091",
    "016040019291505056fe416464726573733a206c6f772d6c6576656c2064656c65676174652063616c6c206661696c65",
    "64a164736f6c6343000812000a416464726573733a206c6f772d6c6576656c2064656c65676174652063616c6c206661",
    "696c6564",
];

/// Proxy used by factory v0.3.0.
pub const PROXY_CREATION_CODE_V2: &[&str] = &[
    "60806040526040516103f43803806103f483398101604081905261002291610268565b61002c8282610033565b505061",
    "0358565b61003c82610092565b6040516001600160a01b038316907fbc7cd75a20ee27fd9adebab32041f755214dbc6b",
    "ffa90cc0225b39da2e5c2d3b90600090a280511561008657610081828261010e565b505050565b61008e610185565b50",
    "50565b806001600160a01b03163b6000036100cd57604051634c9c8ce360e01b81526001600160a01b03821660048201",
    "526024015b60405180910390fd5b7f360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc80",
    "546001600160a01b0319166001600160a01b0392909216919091179055565b6060600080846001600160a01b03168460",
    "405161012b919061033c565b600060405180830381855af49150503d8060008114610166576040519150601f19603f3d",
    "011682016040523d82523d6000602084013e61016b565b606091505b50909250905061017c8583836101a6565b959450",
    "50505050565b34156101a45760405163b398979f60e01b815260040160405180910390fd5b565b6060826101bb576101",
    "b682610205565b6101fe565b81511580156101d257506001600160a01b0384163b155b156101fb57604051639996b315",
    "60e01b81526001600160a01b03851660048201526024016100c4565b50805b9392505050565b80511561021557805180",
    "82602001fd5b604051630a12f52160e11b815260040160405180910390fd5b634e487b7160e01b600052604160045260",
    "246000fd5b60005b8381101561025f578181015183820152602001610247565b50506000910152565b60008060408385",
    "03121561027b57600080fd5b82516001600160a01b038116811461029257600080fd5b60208401519092506001600160",
    "401b038111156102ae57600080fd5b8301601f810185136102bf57600080fd5b80516001600160401b038111156102d8",
    "576102d861022e565b604051601f8201601f19908116603f011681016001600160401b03811182821017156103065761",
    "030661022e565b60405281815282820160200187101561031e57600080fd5b61032f826020830160208601610244565b",
    "8093505050509250929050565b6000825161034e818460208701610244565b9190910192915050565b608e8061036660",
    "00396000f3fe6080604052600a600c565b005b60186014601a565b605e565b565b600060597f360894a13ba1a3210667",
    "c828492db98dca3e2076cc3735a920a3ca505d382bbc5473ffffffffffffffffffffffffffffffffffffffff1690565b",
    "905090565b3660008037600080366000845af43d6000803e808015607c573d6000f35b3d6000fdfea164736f6c634300",
    "081b000a",
];

/// Decodes a chunked creation code constant into bytes.
pub fn creation_code(chunks: &[&str]) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(chunks.concat())
}
